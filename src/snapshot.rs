use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    id_list::IdLists,
    spec::{ConfigSpecs, Specs},
};

/// Provenance of an evaluation result.
///
/// Listed in priority order: an override always wins, then the store-level sources.
/// `Unrecognized` and `Uninitialized` describe the absence of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    /// Value forced by `override_gate` / `override_config` / `override_layer`.
    LocalOverride,
    /// Specs came from bootstrap values supplied at construction.
    Bootstrap,
    /// Specs came from the data adapter.
    DataAdapter,
    /// Specs were fetched from the network.
    Network,
    /// Specs are present but the requested name is not among them.
    Unrecognized,
    /// No specs have been obtained yet.
    Uninitialized,
}

impl Reason {
    /// Name used in event metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::LocalOverride => "LocalOverride",
            Reason::Bootstrap => "Bootstrap",
            Reason::DataAdapter => "DataAdapter",
            Reason::Network => "Network",
            Reason::Unrecognized => "Unrecognized",
            Reason::Uninitialized => "Uninitialized",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl log::kv::ToValue for Reason {
    fn to_value(&self) -> log::kv::Value {
        log::kv::Value::from_display(self)
    }
}

/// An immutable view of all known specs and ID lists plus their provenance.
///
/// A snapshot is never modified after it is published. Updates build a new snapshot (sharing
/// unchanged parts through `Arc`) and replace the old one as a whole.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Gates, configs and layers by name.
    pub specs: Arc<Specs>,
    /// ID lists by name.
    pub id_lists: Arc<IdLists>,
    /// Generation time of the specs document (milliseconds since epoch). 0 if uninitialized.
    pub last_update_time: u64,
    /// `last_update_time` of the first specs this store was initialized with.
    pub init_time: u64,
    /// One of `Bootstrap`, `DataAdapter`, `Network` or `Uninitialized`.
    pub reason: Reason,
}

impl Snapshot {
    /// The snapshot a store starts with: no specs, [`Reason::Uninitialized`].
    pub fn uninitialized() -> Snapshot {
        Snapshot {
            specs: Arc::default(),
            id_lists: Arc::default(),
            last_update_time: 0,
            init_time: 0,
            reason: Reason::Uninitialized,
        }
    }

    /// `true` once specs have been obtained from any source.
    pub fn is_initialized(&self) -> bool {
        self.reason != Reason::Uninitialized
    }

    /// Build the successor of this snapshot holding `specs`. ID lists are carried over.
    pub(crate) fn with_specs(&self, specs: ConfigSpecs, reason: Reason) -> Snapshot {
        let time = specs.time;
        Snapshot {
            specs: Arc::new(Specs::from_config_specs(specs)),
            id_lists: self.id_lists.clone(),
            last_update_time: time,
            init_time: if self.init_time == 0 {
                time
            } else {
                self.init_time
            },
            reason,
        }
    }

    /// Build the successor of this snapshot holding `id_lists`. Specs and provenance are carried
    /// over.
    pub(crate) fn with_id_lists(&self, id_lists: IdLists) -> Snapshot {
        Snapshot {
            id_lists: Arc::new(id_lists),
            ..self.clone()
        }
    }
}

impl Default for Snapshot {
    fn default() -> Snapshot {
        Snapshot::uninitialized()
    }
}
