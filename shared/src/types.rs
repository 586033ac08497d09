use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use crate::protocol::ResourceKind;

/// Attributes shared by every resource in the node graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceCore {
    /// Globally unique identifier
    pub id: String,

    /// TAI timestamp "<seconds>:<nanoseconds>" of the last attribute change
    pub version: String,

    pub label: String,

    #[serde(default)]
    pub description: String,

    /// Freeform tags, each key mapping to a list of values
    #[serde(default)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl ResourceCore {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub numerator: i64,
    #[serde(default = "default_denominator")]
    pub denominator: i64,
}

fn default_denominator() -> i64 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(flatten)]
    pub core: ResourceCore,

    /// HTTP access href for the Node API (deprecated upstream, still sent)
    pub href: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    pub api: NodeApiInfo,

    #[serde(default)]
    pub caps: Map<String, Value>,

    #[serde(default)]
    pub services: Vec<NodeService>,

    #[serde(default)]
    pub clocks: Vec<Clock>,

    #[serde(default)]
    pub interfaces: Vec<NodeInterface>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeApiInfo {
    pub versions: Vec<String>,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeService {
    pub href: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ref_type", rename_all = "lowercase")]
pub enum Clock {
    Internal {
        name: String,
    },
    Ptp {
        name: String,
        traceable: bool,
        version: String,
        gmid: String,
        locked: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInterface {
    pub name: String,
    pub chassis_id: Option<String>,
    pub port_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(flatten)]
    pub core: ResourceCore,

    /// Device type URN
    #[serde(rename = "type")]
    pub device_type: String,

    pub node_id: String,

    #[serde(default)]
    pub senders: Vec<String>,

    #[serde(default)]
    pub receivers: Vec<String>,

    #[serde(default)]
    pub controls: Vec<DeviceControl>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceControl {
    pub href: String,
    #[serde(rename = "type")]
    pub control_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    #[serde(flatten)]
    pub core: ResourceCore,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grain_rate: Option<Rational>,

    #[serde(default)]
    pub caps: Map<String, Value>,

    pub device_id: String,

    #[serde(default)]
    pub parents: Vec<String>,

    #[serde(default)]
    pub clock_name: Option<String>,

    #[serde(flatten)]
    pub format: SourceFormat,
}

/// Source subtypes, discriminated by the `format` URN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format")]
pub enum SourceFormat {
    #[serde(rename = "urn:x-nmos:format:video")]
    Video,
    #[serde(rename = "urn:x-nmos:format:audio")]
    Audio { channels: Vec<AudioChannel> },
    #[serde(rename = "urn:x-nmos:format:data")]
    Data,
    #[serde(rename = "urn:x-nmos:format:mux")]
    Mux,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioChannel {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    #[serde(flatten)]
    pub core: ResourceCore,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grain_rate: Option<Rational>,

    pub source_id: String,

    pub device_id: String,

    #[serde(default)]
    pub parents: Vec<String>,

    #[serde(flatten)]
    pub format: FlowFormat,
}

/// Flow subtypes. Raw and coded variants of a format share one variant;
/// raw-only attributes are optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format")]
pub enum FlowFormat {
    #[serde(rename = "urn:x-nmos:format:video")]
    Video(VideoFlow),
    #[serde(rename = "urn:x-nmos:format:audio")]
    Audio(AudioFlow),
    #[serde(rename = "urn:x-nmos:format:data")]
    Data(DataFlow),
    #[serde(rename = "urn:x-nmos:format:mux")]
    Mux(MuxFlow),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoFlow {
    pub media_type: String,
    pub frame_width: u32,
    pub frame_height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interlace_mode: Option<String>,
    pub colorspace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_characteristic: Option<String>,
    /// Present on raw video flows only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<VideoComponent>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoComponent {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub bit_depth: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFlow {
    pub media_type: String,
    pub sample_rate: Rational,
    /// Present on raw audio flows only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_depth: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFlow {
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuxFlow {
    pub media_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sender {
    #[serde(flatten)]
    pub core: ResourceCore,

    #[serde(default)]
    pub caps: Map<String, Value>,

    pub flow_id: Option<String>,

    /// Transport type URN
    pub transport: String,

    pub device_id: String,

    pub manifest_href: Option<String>,

    #[serde(default)]
    pub interface_bindings: Vec<String>,

    #[serde(default)]
    pub subscription: SenderSubscription,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SenderSubscription {
    pub receiver_id: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receiver {
    #[serde(flatten)]
    pub core: ResourceCore,

    pub device_id: String,

    /// Transport type URN
    pub transport: String,

    #[serde(default)]
    pub interface_bindings: Vec<String>,

    #[serde(default)]
    pub subscription: ReceiverSubscription,

    #[serde(flatten)]
    pub format: ReceiverFormat,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiverSubscription {
    pub sender_id: Option<String>,
    pub active: bool,
}

/// Receiver subtypes, discriminated by the `format` URN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format")]
pub enum ReceiverFormat {
    #[serde(rename = "urn:x-nmos:format:video")]
    Video { caps: ReceiverCaps },
    #[serde(rename = "urn:x-nmos:format:audio")]
    Audio { caps: ReceiverCaps },
    #[serde(rename = "urn:x-nmos:format:data")]
    Data { caps: ReceiverCaps },
    #[serde(rename = "urn:x-nmos:format:mux")]
    Mux { caps: ReceiverCaps },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiverCaps {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_types: Vec<String>,
}

/// Any resource of the node graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Resource {
    Node(Node),
    Device(Device),
    Source(Source),
    Flow(Flow),
    Sender(Sender),
    Receiver(Receiver),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Node(_) => ResourceKind::Node,
            Resource::Device(_) => ResourceKind::Device,
            Resource::Source(_) => ResourceKind::Source,
            Resource::Flow(_) => ResourceKind::Flow,
            Resource::Sender(_) => ResourceKind::Sender,
            Resource::Receiver(_) => ResourceKind::Receiver,
        }
    }

    pub fn core(&self) -> &ResourceCore {
        match self {
            Resource::Node(r) => &r.core,
            Resource::Device(r) => &r.core,
            Resource::Source(r) => &r.core,
            Resource::Flow(r) => &r.core,
            Resource::Sender(r) => &r.core,
            Resource::Receiver(r) => &r.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut ResourceCore {
        match self {
            Resource::Node(r) => &mut r.core,
            Resource::Device(r) => &mut r.core,
            Resource::Source(r) => &mut r.core,
            Resource::Flow(r) => &mut r.core,
            Resource::Sender(r) => &mut r.core,
            Resource::Receiver(r) => &mut r.core,
        }
    }

    pub fn id(&self) -> &str {
        &self.core().id
    }

    /// Ids of other resources this one points at.
    ///
    /// Device sender/receiver lists are back-references and are not included.
    pub fn references(&self) -> Vec<&str> {
        match self {
            Resource::Node(_) => Vec::new(),
            Resource::Device(d) => vec![d.node_id.as_str()],
            Resource::Source(s) => std::iter::once(s.device_id.as_str())
                .chain(s.parents.iter().map(String::as_str))
                .collect(),
            Resource::Flow(f) => [f.source_id.as_str(), f.device_id.as_str()]
                .into_iter()
                .chain(f.parents.iter().map(String::as_str))
                .collect(),
            Resource::Sender(s) => std::iter::once(s.device_id.as_str())
                .chain(s.flow_id.as_deref())
                .collect(),
            Resource::Receiver(r) => vec![r.device_id.as_str()],
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Access to the common attributes of a concrete resource type.
pub trait HasCore {
    const KIND: ResourceKind;

    fn core(&self) -> &ResourceCore;

    fn id(&self) -> &str {
        &self.core().id
    }
}

macro_rules! impl_has_core {
    ($($ty:ident),*) => {
        $(
            impl HasCore for $ty {
                const KIND: ResourceKind = ResourceKind::$ty;

                fn core(&self) -> &ResourceCore {
                    &self.core
                }
            }

            impl From<$ty> for Resource {
                fn from(r: $ty) -> Self {
                    Resource::$ty(r)
                }
            }
        )*
    };
}

impl_has_core!(Node, Device, Source, Flow, Sender, Receiver);
