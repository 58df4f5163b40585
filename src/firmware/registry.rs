use tracing::debug;

use crate::core::{FirmwareConfig, ModuleId, ModuleSet, MAX_MODULES};
use crate::modules::Module;

/// Fixed table mapping module ids to modules
///
/// Built once from the config; slots of disabled modules stay empty and
/// commands addressed to them are answered with `UnknownModule`.
#[derive(Debug)]
pub struct ModuleRegistry {
    slots: [Option<Module>; MAX_MODULES],
}

impl ModuleRegistry {
    pub fn from_config(config: &FirmwareConfig) -> Self {
        let mut slots: [Option<Module>; MAX_MODULES] = std::array::from_fn(|_| None);
        for kind in config.enabled_modules.kinds() {
            debug!("registering {} module under id {}", kind.name(), kind as u8);
            slots[kind.id().index()] = Some(Module::new(kind, config));
        }
        ModuleRegistry { slots }
    }

    pub fn get_mut(&mut self, id: ModuleId) -> Option<&mut Module> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    pub fn contains(&self, id: ModuleId) -> bool {
        matches!(self.slots.get(id.index()), Some(Some(_)))
    }

    /// Occupied slots in id order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ModuleId, &mut Module)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_mut().map(|module| (ModuleId(index as u8), module)))
    }

    /// Modules present in the table
    pub fn modules(&self) -> ModuleSet {
        self.slots
            .iter()
            .flatten()
            .map(|module| module.kind())
            .collect()
    }
}
