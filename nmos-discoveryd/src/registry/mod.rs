pub mod client;
pub mod controller;

pub use client::{Health, RegisterResponse, RegistrationStatus, RegistryClient};
pub use controller::{ControllerSettings, RegistrationController, RegistrationHandle, RegistrationState};
