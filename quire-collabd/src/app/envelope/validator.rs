use crate::domain::operation::Operation;
use serde_json::{Map, Value};
use thiserror::Error;

/// Extra keys allowed next to `destroy` (such as `params`).
pub const MAX_DESTROY_AUXILIARY_KEYS: usize = 2;

const INTENT_KEYS: [&str; 3] = ["auth", "destroy", "operations"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("wrong input message: {0}")]
    WrongInputMessage(String),
}

fn wrong(reason: impl Into<String>) -> EnvelopeError {
    EnvelopeError::WrongInputMessage(reason.into())
}

/// A frame carrying exactly one intent.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    KeepAlive,
    Auth(Map<String, Value>),
    Destroy {
        body: Value,
        auxiliary: Map<String, Value>,
    },
    Operations(Vec<Operation>),
}

impl Envelope {
    pub fn intent(&self) -> &'static str {
        match self {
            Envelope::KeepAlive => "keep-alive",
            Envelope::Auth(_) => "auth",
            Envelope::Destroy { .. } => "destroy",
            Envelope::Operations(_) => "operations",
        }
    }
}

pub fn classify(frame: &Map<String, Value>) -> Result<Envelope, EnvelopeError> {
    if frame.is_empty() {
        return Ok(Envelope::KeepAlive);
    }

    let intents: Vec<&str> = INTENT_KEYS
        .into_iter()
        .filter(|key| frame.contains_key(*key))
        .collect();
    let intent = match intents.as_slice() {
        [] => return Err(wrong("frame carries no auth, destroy or operations key")),
        [intent] => *intent,
        _ => return Err(wrong(format!("mixed envelope: {}", intents.join(" + ")))),
    };

    match intent {
        "auth" => {
            if frame.len() != 1 {
                return Err(wrong("auth frames cannot carry other keys"));
            }
            match frame.get("auth") {
                Some(Value::Object(body)) => Ok(Envelope::Auth(body.clone())),
                _ => Err(wrong("auth must be an object")),
            }
        }
        "operations" => {
            if frame.len() != 1 {
                return Err(wrong("operations frames cannot carry other keys"));
            }
            let Some(Value::Array(items)) = frame.get("operations") else {
                return Err(wrong("operations must be an array"));
            };
            items
                .iter()
                .map(|item| {
                    serde_json::from_value::<Operation>(item.clone())
                        .map_err(|err| wrong(format!("invalid operation: {err}")))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Envelope::Operations)
        }
        _ => {
            let body = frame.get("destroy").cloned().unwrap_or(Value::Null);
            if !matches!(body, Value::Bool(true) | Value::Object(_)) {
                return Err(wrong("destroy must be true or an object"));
            }
            let auxiliary: Map<String, Value> = frame
                .iter()
                .filter(|(key, _)| key.as_str() != "destroy")
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            if auxiliary.len() > MAX_DESTROY_AUXILIARY_KEYS {
                return Err(wrong(format!(
                    "destroy allows at most {MAX_DESTROY_AUXILIARY_KEYS} extra keys"
                )));
            }
            Ok(Envelope::Destroy { body, auxiliary })
        }
    }
}
