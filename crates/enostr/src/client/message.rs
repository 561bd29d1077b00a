use crate::{Error, Filter, SubId};
use serde_json::json;

/// Messages sent by clients, received by relays
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Req { sub_id: String, filters: Vec<Filter> },
    Close { sub_id: String },
}

impl ClientMessage {
    pub fn req(sub_id: &SubId, filters: Vec<Filter>) -> Self {
        ClientMessage::Req {
            sub_id: sub_id.as_str().to_owned(),
            filters,
        }
    }

    pub fn close(sub_id: &SubId) -> Self {
        ClientMessage::Close {
            sub_id: sub_id.as_str().to_owned(),
        }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(match self {
            Self::Req { sub_id, filters } => {
                if filters.is_empty() {
                    format!("[\"REQ\",\"{}\",{{}}]", sub_id)
                } else {
                    let filters_json_str: Result<Vec<String>, Error> =
                        filters.iter().map(Filter::json).collect();
                    format!("[\"REQ\",\"{}\",{}]", sub_id, filters_json_str?.join(","))
                }
            }
            Self::Close { sub_id } => json!(["CLOSE", sub_id]).to_string(),
        })
    }
}
