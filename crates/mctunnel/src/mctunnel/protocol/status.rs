use serde::{Deserialize, Serialize};

/// JSON body of a status response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub version: StatusVersion,
    pub players: StatusPlayers,
    pub description: Description,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusVersion {
    pub name: String,
    pub protocol: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPlayers {
    pub max: i32,
    pub online: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample: Vec<PlayerSample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSample {
    pub name: String,
    pub id: String,
}

/// Servers send either a bare string or a text component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Description {
    Text { text: String },
    Plain(String),
}

impl Description {
    #[cfg(test)]
    pub fn text(&self) -> &str {
        match self {
            Description::Text { text } => text,
            Description::Plain(s) => s,
        }
    }
}

impl ServerStatus {
    pub fn new(version_name: &str, protocol: i32, max_players: i32, motd: &str) -> Self {
        Self {
            version: StatusVersion {
                name: version_name.to_string(),
                protocol,
            },
            players: StatusPlayers {
                max: max_players,
                online: 0,
                sample: Vec::new(),
            },
            description: Description::Text {
                text: motd.to_string(),
            },
            favicon: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_text_component() {
        let s = ServerStatus::new("mctunnel", 763, 0, "hello");
        let v: serde_json::Value = serde_json::to_value(&s).unwrap();
        assert_eq!(v["version"]["protocol"], 763);
        assert_eq!(v["description"]["text"], "hello");
        assert!(v.get("favicon").is_none());
        assert!(v["players"].get("sample").is_none());
    }

    #[test]
    fn accepts_plain_description() {
        let s: ServerStatus = serde_json::from_str(
            r#"{"version":{"name":"x","protocol":47},"players":{"max":1,"online":0},"description":"hi"}"#,
        )
        .unwrap();
        assert_eq!(s.description.text(), "hi");
    }
}
