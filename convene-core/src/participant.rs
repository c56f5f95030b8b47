use serde::{Deserialize, Serialize};

/// One roster entry, as sent in a LOAD_SUBSCRIBERS response.
///
/// `scid` is the scoped connection id (stable per user within a topic);
/// `cids` are the device/tab connection ids currently behind it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Participant {
    pub scid: String,
    pub cids: Vec<String>,
    pub name: String,
    pub role: String,
    pub color: String,
    pub exists: bool,
    pub online: bool,
}

impl Participant {
    pub fn new(scid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scid: scid.into(),
            name: name.into(),
            exists: true,
            ..Self::default()
        }
    }

    pub fn with_cid(mut self, cid: impl Into<String>) -> Self {
        self.cids.push(cid.into());
        self
    }

    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn has_cid(&self, cid: &str) -> bool {
        self.cids.iter().any(|c| c == cid)
    }
}
