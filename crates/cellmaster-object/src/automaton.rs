//! The master automaton: the object manager behind the meta-state.

use crate::object_manager::ObjectManager;
use crate::proto::{DESTROY_OBJECTS_MUTATION, EXECUTE_VERB_MUTATION};
use cellmaster_common::{MasterConfig, ObjectId};
use cellmaster_meta_state::{CompositeAutomaton, SavePriority};

pub type MasterAutomaton = CompositeAutomaton<ObjectManager>;

const KEYS_SECTION: &str = "ObjectManager.Keys";
const VALUES_SECTION: &str = "ObjectManager.Values";
const ATTRIBUTES_SECTION: &str = "ObjectManager.Attributes";
const ZOMBIES_SECTION: &str = "GarbageCollector.Zombies";
const RESPONSES_SECTION: &str = "ResponseKeeper.Responses";

/// Build the automaton with both mutations and every snapshot section
/// registered.
pub fn master_automaton(config: &MasterConfig) -> MasterAutomaton {
    let mut automaton = CompositeAutomaton::new(ObjectManager::new(config));

    automaton.register_method(EXECUTE_VERB_MUTATION, ObjectManager::replay_verb);
    automaton.register_method(DESTROY_OBJECTS_MUTATION, ObjectManager::destroy_objects);

    automaton.register_saver(SavePriority::Keys, KEYS_SECTION, |objects| {
        Ok(bincode::serialize(&objects.save_keys())?)
    });
    automaton.register_loader(KEYS_SECTION, |objects, data| {
        let ids: Vec<ObjectId> = bincode::deserialize(data)?;
        objects.load_keys(ids);
        Ok(())
    });

    automaton.register_saver(SavePriority::Values, VALUES_SECTION, |objects| {
        Ok(bincode::serialize(&objects.save_values())?)
    });
    automaton.register_loader(VALUES_SECTION, |objects, data| {
        objects.load_values(bincode::deserialize(data)?);
        Ok(())
    });

    automaton.register_saver(SavePriority::Values, ATTRIBUTES_SECTION, |objects| {
        Ok(bincode::serialize(&objects.save_attributes())?)
    });
    automaton.register_loader(ATTRIBUTES_SECTION, |objects, data| {
        objects.load_attributes(bincode::deserialize(data)?);
        Ok(())
    });

    automaton.register_saver(SavePriority::Values, ZOMBIES_SECTION, |objects| {
        Ok(bincode::serialize(&objects.save_zombies())?)
    });
    automaton.register_loader(ZOMBIES_SECTION, |objects, data| {
        objects.load_zombies(bincode::deserialize(data)?);
        Ok(())
    });

    automaton.register_saver(SavePriority::Values, RESPONSES_SECTION, |objects| {
        Ok(bincode::serialize(&objects.save_responses())?)
    });
    automaton.register_loader(RESPONSES_SECTION, |objects, data| {
        objects.load_responses(bincode::deserialize(data)?);
        Ok(())
    });

    automaton
}
