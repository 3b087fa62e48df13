use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Durability and ordering scope of an operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Channel {
    Client,
    User,
    #[default]
    Project,
}

impl Channel {
    pub fn name(&self) -> &'static str {
        match self {
            Channel::Client => "client",
            Channel::User => "user",
            Channel::Project => "project",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "client" => Ok(Channel::Client),
            "user" => Ok(Channel::User),
            "project" => Ok(Channel::Project),
            _ => Err(value.to_string()),
        }
    }
}

impl Serialize for Channel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value
            .parse()
            .map_err(|other| D::Error::custom(format!("unknown channel: {other}")))
    }
}

/// Client-assigned identity of an operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationId {
    #[serde(deserialize_with = "id_part")]
    pub client_id: String,
    #[serde(deserialize_with = "id_part")]
    pub local_id: String,
}

impl OperationId {
    pub fn new(client_id: impl Into<String>, local_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            local_id: local_id.into(),
        }
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_id, self.local_id)
    }
}

// Browsers send either numeric or string ids.
fn id_part<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(value) => Ok(value),
        Value::Number(value) => Ok(value.to_string()),
        other => Err(D::Error::custom(format!(
            "operation id part must be a string or number, got {other}"
        ))),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationProperties {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<OperationId>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single edit or signal exchanged over the socket.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub properties: OperationProperties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Operation {
    pub fn new(channel: Channel, kind: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.name().to_string()),
            properties: OperationProperties {
                kind: kind.into(),
                ..OperationProperties::default()
            },
            index: None,
            timestamp: None,
        }
    }

    /// Missing channels default to the project log.
    pub fn channel(&self) -> Result<Channel, String> {
        match self.channel.as_deref() {
            None => Ok(Channel::Project),
            Some(value) => value.parse(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        OperationKind::parse(&self.properties.kind)
    }

    pub fn group(&self) -> OperationGroup {
        OperationGroup::parse(self.properties.group.as_deref())
    }

    pub fn sub_type(&self) -> Option<&str> {
        self.properties.sub_type.as_deref()
    }

    pub fn id(&self) -> Option<&OperationId> {
        self.properties.id.as_ref()
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.extra.get(name)
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: Value) {
        self.properties.extra.insert(name.into(), value);
    }

    pub fn with_sub_type(mut self, sub_type: impl Into<String>) -> Self {
        self.properties.sub_type = Some(sub_type.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.properties.group = Some(group.into());
        self
    }

    pub fn with_id(mut self, id: OperationId) -> Self {
        self.properties.id = Some(id);
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set_property(name, value);
        self
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// `properties.type` resolved to the kinds the server treats specially.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Track,
    Hold,
    Users,
    Mode,
    Cancel,
    Pages,
    Content(String),
}

impl OperationKind {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "track" => OperationKind::Track,
            "hold" => OperationKind::Hold,
            "users" => OperationKind::Users,
            "mode" => OperationKind::Mode,
            "cancel" => OperationKind::Cancel,
            "pages" => OperationKind::Pages,
            _ => OperationKind::Content(value.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            OperationKind::Track => "track",
            OperationKind::Hold => "hold",
            OperationKind::Users => "users",
            OperationKind::Mode => "mode",
            OperationKind::Cancel => "cancel",
            OperationKind::Pages => "pages",
            OperationKind::Content(name) => name.as_str(),
        }
    }

    /// Kinds that read or change the document itself.
    pub fn requires_document_access(&self) -> bool {
        !matches!(
            self,
            OperationKind::Track | OperationKind::Users | OperationKind::Mode
        )
    }
}

/// Rebuild bucket of a content operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationGroup {
    Erase,
    Template,
    FreeTool,
}

impl OperationGroup {
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::to_ascii_lowercase).as_deref() {
            Some("erase") => OperationGroup::Erase,
            Some("template") | Some("fillable") => OperationGroup::Template,
            _ => OperationGroup::FreeTool,
        }
    }
}

/// Ordering witness for a stored operation:
/// `channel-index-group-type-subType-clientId-localId`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OperationRef {
    channel: Channel,
    index: Option<u64>,
    descriptor: String,
}

impl OperationRef {
    pub fn new(channel: Channel, operation: &Operation) -> Self {
        let properties = &operation.properties;
        let (client_id, local_id) = properties
            .id
            .as_ref()
            .map(|id| (id.client_id.as_str(), id.local_id.as_str()))
            .unwrap_or(("", ""));
        let descriptor = [
            properties.group.as_deref().unwrap_or(""),
            properties.kind.as_str(),
            properties.sub_type.as_deref().unwrap_or(""),
            client_id,
            local_id,
        ]
        .join("-");
        Self {
            channel,
            index: operation.index,
            descriptor,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn index(&self) -> Option<u64> {
        self.index
    }
}

impl fmt::Display for OperationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-", self.channel)?;
        if let Some(index) = self.index {
            write!(f, "{index}")?;
        }
        write!(f, "-{}", self.descriptor)
    }
}

impl FromStr for OperationRef {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut parts = value.splitn(3, '-');
        let (Some(channel), Some(index), Some(descriptor)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("malformed operation ref: {value}"));
        };
        let index = if index.is_empty() {
            None
        } else {
            Some(
                index
                    .parse()
                    .map_err(|_| format!("malformed operation ref index: {value}"))?,
            )
        };
        Ok(Self {
            channel: channel.parse()?,
            index,
            descriptor: descriptor.to_string(),
        })
    }
}
