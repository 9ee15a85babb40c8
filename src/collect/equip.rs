//! Avatar Loadout
//!
//! Which collected cosmetics are currently worn, one per slot.

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::collect::drop::{DropCatalog, ItemSlot};
use crate::collect::engine::CollectedSet;

/// Equipped item per slot. `None` means the slot is empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Equipped {
    /// Head slot.
    #[serde(default)]
    pub hat: Option<String>,
    /// Body slot.
    #[serde(default)]
    pub body: Option<String>,
    /// Outside slot.
    #[serde(default)]
    pub outside: Option<String>,
}

/// Loadout validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EquipError {
    /// Item is not in the drop catalog.
    #[error("unknown item '{0}'")]
    UnknownItem(String),
    /// Item exists but the user has not collected it.
    #[error("item '{0}' has not been collected")]
    NotCollected(String),
    /// Item belongs to a different slot.
    #[error("item '{item}' is a {actual} item, cannot equip as {requested}")]
    WrongSlot {
        /// Item identifier.
        item: String,
        /// Slot it was equipped in.
        requested: &'static str,
        /// Slot the item belongs to.
        actual: &'static str,
    },
}

impl Equipped {
    /// Item in a given slot.
    pub fn slot(&self, slot: ItemSlot) -> Option<&str> {
        match slot {
            ItemSlot::Hat => self.hat.as_deref(),
            ItemSlot::Body => self.body.as_deref(),
            ItemSlot::Outside => self.outside.as_deref(),
        }
    }

    /// Iterate occupied slots.
    pub fn occupied(&self) -> impl Iterator<Item = (ItemSlot, &str)> + '_ {
        ItemSlot::ALL
            .into_iter()
            .filter_map(move |slot| self.slot(slot).map(|id| (slot, id)))
    }

    /// True if no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.occupied().next().is_none()
    }

    /// Check every equipped item exists, is collected, and fits its slot.
    pub fn validate(&self, catalog: &DropCatalog, collected: &CollectedSet) -> Result<(), EquipError> {
        for (slot, id) in self.occupied() {
            let item = catalog
                .get(id)
                .ok_or_else(|| EquipError::UnknownItem(id.to_string()))?;

            if item.slot != slot {
                return Err(EquipError::WrongSlot {
                    item: id.to_string(),
                    requested: slot.as_str(),
                    actual: item.slot.as_str(),
                });
            }

            if !collected.contains(id) {
                return Err(EquipError::NotCollected(id.to_string()));
            }
        }
        Ok(())
    }

    /// Drop anything that is no longer collected.
    ///
    /// Used after the collected set is replaced so the loadout never
    /// refers to items the user does not own.
    pub fn retain_collected(&mut self, collected: &CollectedSet) -> bool {
        let mut changed = false;
        for slot in [&mut self.hat, &mut self.body, &mut self.outside] {
            if slot.as_ref().is_some_and(|id| !collected.contains(id)) {
                *slot = None;
                changed = true;
            }
        }
        changed
    }
}
