use crate::domain::operation::Channel;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Separator between the components of an encoded session id.
pub const UID_DELIMITER: char = '_';

fn validate_component(kind: &str, value: String) -> Result<String, String> {
    if value.trim().is_empty() {
        return Err(format!("{kind} cannot be empty"));
    }
    if value.contains(UID_DELIMITER) {
        return Err(format!("{kind} cannot contain '{UID_DELIMITER}'"));
    }
    Ok(value)
}

macro_rules! uid_component {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, String> {
                validate_component($label, value.into()).map(Self)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let value = String::deserialize(deserializer)?;
                $name::new(value).map_err(D::Error::custom)
            }
        }
    };
}

uid_component!(
    /// Account identifier issued by the session directory.
    UserId,
    "user id"
);
uid_component!(
    /// Document project the connection is editing.
    ProjectId,
    "project id"
);
uid_component!(
    /// Transport-level handle distinguishing tabs of the same user.
    SocketId,
    "socket id"
);

impl SocketId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

/// Session id: `userId_projectId[_socketId]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Uid {
    user_id: UserId,
    project_id: ProjectId,
    socket_id: Option<SocketId>,
}

impl Uid {
    pub fn new(user_id: UserId, project_id: ProjectId, socket_id: Option<SocketId>) -> Self {
        Self {
            user_id,
            project_id,
            socket_id,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub fn socket_id(&self) -> Option<&SocketId> {
        self.socket_id.as_ref()
    }

    pub fn is_socket_scoped(&self) -> bool {
        self.socket_id.is_some()
    }

    /// Same user and project without the socket component.
    pub fn project_scoped(&self) -> Uid {
        Uid {
            user_id: self.user_id.clone(),
            project_id: self.project_id.clone(),
            socket_id: None,
        }
    }

    pub fn same_member(&self, other: &Uid) -> bool {
        self.user_id == other.user_id && self.project_id == other.project_id
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{UID_DELIMITER}{}", self.user_id, self.project_id)?;
        if let Some(socket) = &self.socket_id {
            write!(f, "{UID_DELIMITER}{socket}")?;
        }
        Ok(())
    }
}

impl FromStr for Uid {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = value.split(UID_DELIMITER).collect();
        match parts.as_slice() {
            [user, project] => Ok(Uid::new(UserId::new(*user)?, ProjectId::new(*project)?, None)),
            [user, project, socket] => Ok(Uid::new(
                UserId::new(*user)?,
                ProjectId::new(*project)?,
                Some(SocketId::new(*socket)?),
            )),
            _ => Err(format!("malformed session id: {value}")),
        }
    }
}

impl Serialize for Uid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(D::Error::custom)
    }
}

/// Store partition an operation is written to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SessionKey {
    Client(Uid),
    User { user: UserId, project: ProjectId },
    Project(ProjectId),
}

impl SessionKey {
    pub fn for_channel(uid: &Uid, channel: Channel) -> Self {
        match channel {
            Channel::Client => SessionKey::Client(uid.clone()),
            Channel::User => SessionKey::User {
                user: uid.user_id().clone(),
                project: uid.project_id().clone(),
            },
            Channel::Project => SessionKey::Project(uid.project_id().clone()),
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            SessionKey::Client(_) => Channel::Client,
            SessionKey::User { .. } => Channel::User,
            SessionKey::Project(_) => Channel::Project,
        }
    }

    pub fn project_id(&self) -> &ProjectId {
        match self {
            SessionKey::Client(uid) => uid.project_id(),
            SessionKey::User { project, .. } => project,
            SessionKey::Project(project) => project,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::Client(uid) => write!(f, "client:{uid}"),
            SessionKey::User { user, project } => {
                write!(f, "user:{user}{UID_DELIMITER}{project}")
            }
            SessionKey::Project(project) => write!(f, "project:{project}"),
        }
    }
}
