//! The replicated state machine interface and a registration-based
//! implementation of it.

use crate::mutation::MutationContext;
use crate::snapshot::{SavePriority, SnapshotSection};
use cellmaster_common::{Error, Result};
use std::collections::HashMap;
use tracing::debug;

/// A deterministic state machine driven by logged mutations.
///
/// Every method runs on the state thread. `apply` must not fail: methods
/// validate before touching state, and anything else is a divergence bug.
pub trait Automaton: Send + 'static {
    /// Reset to the empty initial state.
    fn clear(&mut self);

    /// Serialize the full state as ordered sections.
    fn save(&self) -> Result<Vec<SnapshotSection>>;

    /// Restore from sections produced by `save`; the automaton is cleared first.
    fn load(&mut self, sections: &[SnapshotSection]) -> Result<()>;

    /// Apply one mutation.
    fn apply(&mut self, context: &mut MutationContext);

    fn on_recovery_started(&mut self) {}
    fn on_recovery_complete(&mut self) {}
    fn on_start_leading(&mut self) {}
    fn on_leader_recovery_complete(&mut self) {}
    fn on_stop_leading(&mut self) {}
    fn on_start_following(&mut self) {}
    fn on_follower_recovery_complete(&mut self) {}
    fn on_stop_following(&mut self) {}
}

/// State owned by a [`CompositeAutomaton`]; receives clear and lifecycle hooks.
pub trait AutomatonState: Send + 'static {
    fn clear(&mut self);

    /// Rebuild derived indices after every section has been loaded.
    fn on_loaded(&mut self) {}

    fn on_recovery_started(&mut self) {}
    fn on_recovery_complete(&mut self) {}
    fn on_start_leading(&mut self) {}
    fn on_leader_recovery_complete(&mut self) {}
    fn on_stop_leading(&mut self) {}
    fn on_start_following(&mut self) {}
    fn on_follower_recovery_complete(&mut self) {}
    fn on_stop_following(&mut self) {}
}

type Method<S> = Box<dyn Fn(&mut S, &mut MutationContext) + Send + Sync>;
type Saver<S> = Box<dyn Fn(&S) -> Result<Vec<u8>> + Send + Sync>;
type Loader<S> = Box<dyn Fn(&mut S, &[u8]) -> Result<()> + Send + Sync>;

struct SaverEntry<S> {
    priority: SavePriority,
    name: String,
    saver: Saver<S>,
}

/// Automaton assembled from registered mutation methods, savers and loaders.
pub struct CompositeAutomaton<S> {
    state: S,
    methods: HashMap<String, Method<S>>,
    savers: Vec<SaverEntry<S>>,
    loaders: HashMap<String, Loader<S>>,
}

impl<S: AutomatonState> CompositeAutomaton<S> {
    pub fn new(state: S) -> Self {
        Self {
            state,
            methods: HashMap::new(),
            savers: Vec::new(),
            loaders: HashMap::new(),
        }
    }

    /// Bind a mutation type to its handler.
    pub fn register_method(
        &mut self,
        name: impl Into<String>,
        method: impl Fn(&mut S, &mut MutationContext) + Send + Sync + 'static,
    ) {
        let name = name.into();
        let previous = self.methods.insert(name.clone(), Box::new(method));
        assert!(previous.is_none(), "mutation method {name} registered twice");
    }

    /// Add a snapshot section writer. Sections are saved ordered by
    /// priority, then by registration order.
    pub fn register_saver(
        &mut self,
        priority: SavePriority,
        name: impl Into<String>,
        saver: impl Fn(&S) -> Result<Vec<u8>> + Send + Sync + 'static,
    ) {
        self.savers.push(SaverEntry {
            priority,
            name: name.into(),
            saver: Box::new(saver),
        });
        self.savers.sort_by_key(|entry| entry.priority);
    }

    pub fn register_loader(
        &mut self,
        name: impl Into<String>,
        loader: impl Fn(&mut S, &[u8]) -> Result<()> + Send + Sync + 'static,
    ) {
        let name = name.into();
        let previous = self.loaders.insert(name.clone(), Box::new(loader));
        assert!(previous.is_none(), "snapshot loader {name} registered twice");
    }

    pub const fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }
}

impl<S: AutomatonState> Automaton for CompositeAutomaton<S> {
    fn clear(&mut self) {
        self.state.clear();
    }

    fn save(&self) -> Result<Vec<SnapshotSection>> {
        self.savers
            .iter()
            .map(|entry| {
                Ok(SnapshotSection {
                    priority: entry.priority,
                    name: entry.name.clone(),
                    data: (entry.saver)(&self.state)?,
                })
            })
            .collect()
    }

    fn load(&mut self, sections: &[SnapshotSection]) -> Result<()> {
        let mut ordered: Vec<&SnapshotSection> = sections.iter().collect();
        ordered.sort_by_key(|section| section.priority);
        for section in ordered {
            let loader = self.loaders.get(&section.name).ok_or_else(|| {
                Error::Snapshot(format!("unknown snapshot section {}", section.name))
            })?;
            loader(&mut self.state, &section.data)?;
            debug!(section = %section.name, bytes = section.data.len(), "Snapshot section loaded");
        }
        self.state.on_loaded();
        Ok(())
    }

    fn apply(&mut self, context: &mut MutationContext) {
        let Some(method) = self.methods.get(context.mutation_type()) else {
            panic!("unknown mutation type {}", context.mutation_type());
        };
        method(&mut self.state, context);
    }

    fn on_recovery_started(&mut self) {
        self.state.on_recovery_started();
    }

    fn on_recovery_complete(&mut self) {
        self.state.on_recovery_complete();
    }

    fn on_start_leading(&mut self) {
        self.state.on_start_leading();
    }

    fn on_leader_recovery_complete(&mut self) {
        self.state.on_leader_recovery_complete();
    }

    fn on_stop_leading(&mut self) {
        self.state.on_stop_leading();
    }

    fn on_start_following(&mut self) {
        self.state.on_start_following();
    }

    fn on_follower_recovery_complete(&mut self) {
        self.state.on_follower_recovery_complete();
    }

    fn on_stop_following(&mut self) {
        self.state.on_stop_following();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mutation::MutationRecord;
    use cellmaster_common::MetaVersion;

    /// Key/value register used by the meta-state tests.
    #[derive(Default)]
    pub struct Register {
        pub entries: Vec<(String, u64)>,
        pub loaded: bool,
    }

    impl AutomatonState for Register {
        fn clear(&mut self) {
            self.entries.clear();
            self.loaded = false;
        }

        fn on_loaded(&mut self) {
            self.loaded = true;
        }
    }

    pub fn register_automaton() -> CompositeAutomaton<Register> {
        let mut automaton = CompositeAutomaton::new(Register::default());
        automaton.register_method("Register.Push", |state: &mut Register, context| {
            let key = String::from_utf8_lossy(context.data()).into_owned();
            let value = context.version().to_revision();
            state.entries.push((key, value));
            context.set_response(state.entries.len().to_le_bytes().to_vec());
        });
        automaton.register_saver(SavePriority::Values, "Register.Values", |state| {
            Ok(bincode::serialize(&state.entries)?)
        });
        automaton.register_saver(SavePriority::Keys, "Register.Keys", |state| {
            Ok(bincode::serialize(&state.entries.len())?)
        });
        automaton.register_loader("Register.Keys", |state, data| {
            let len: usize = bincode::deserialize(data)?;
            state.entries.reserve(len);
            Ok(())
        });
        automaton.register_loader("Register.Values", |state, data| {
            state.entries = bincode::deserialize(data)?;
            Ok(())
        });
        automaton
    }

    pub fn push_record(key: &str) -> MutationRecord {
        MutationRecord {
            mutation_type: "Register.Push".into(),
            random_seed: 7,
            timestamp_ms: 0,
            data: key.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_apply_dispatches_by_type() {
        let mut automaton = register_automaton();
        let mut context = MutationContext::new(MetaVersion::new(0, 5), push_record("a"), false);
        automaton.apply(&mut context);
        assert_eq!(automaton.state().entries, vec![("a".to_string(), 5)]);
        assert!(context.response().is_some());
    }

    #[test]
    #[should_panic(expected = "unknown mutation type")]
    fn test_unknown_method_is_fatal() {
        let mut automaton = register_automaton();
        let mut record = push_record("a");
        record.mutation_type = "Nope".into();
        automaton.apply(&mut MutationContext::new(MetaVersion::default(), record, false));
    }

    #[test]
    fn test_save_orders_keys_before_values() {
        let mut automaton = register_automaton();
        automaton.state_mut().entries.push(("x".into(), 1));
        let sections = automaton.save().unwrap();
        let names: Vec<_> = sections.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Register.Keys", "Register.Values"]);

        let mut restored = register_automaton();
        restored.clear();
        restored.load(&sections).unwrap();
        assert_eq!(restored.state().entries, vec![("x".to_string(), 1)]);
        assert!(restored.state().loaded);
    }

    #[test]
    fn test_unknown_section_is_rejected() {
        let mut automaton = register_automaton();
        let sections = vec![SnapshotSection {
            priority: SavePriority::Keys,
            name: "Other.Keys".into(),
            data: Vec::new(),
        }];
        assert!(automaton.load(&sections).is_err());
    }
}
