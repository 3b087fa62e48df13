pub mod value_object;

pub use value_object::{ProjectId, SessionKey, SocketId, Uid, UserId, UID_DELIMITER};
