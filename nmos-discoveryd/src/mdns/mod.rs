pub mod advertise;
pub mod browser;

pub use advertise::MdnsAdvertiser;
pub use browser::{BrowserEvent, MdnsBrowser, ServiceWatch};
