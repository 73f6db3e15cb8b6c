use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Object id of the daemon's own reserved object.
pub const DAEMON_OBJECT_ID: &str = "Remoto.Daemon";

/// Method name used to read an exposed attribute.
pub const GETATTR_METHOD: &str = "__getattr__";

/// Method name used to write an exposed attribute.
pub const SETATTR_METHOD: &str = "__setattr__";

/// Method name carried by batch invocations; the real names are in the entries.
pub const BATCH_METHOD: &str = "<batch>";

/// What a registered object exposes, as reported to proxies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub methods: BTreeSet<String>,
    pub oneway: BTreeSet<String>,
    pub attrs: BTreeSet<String>,
}

impl ObjectMetadata {
    /// Whether a call of `name` can succeed on the remote side.
    pub fn allows(&self, name: &str) -> bool {
        name == GETATTR_METHOD || name == SETATTR_METHOD || self.methods.contains(name)
    }
}
