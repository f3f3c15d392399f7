//! Built-in node library.

pub mod action;
pub mod control;
pub mod data;
pub mod state;

use crate::registry::Registry;

pub(crate) fn register(registry: &mut Registry) {
    data::register(registry);
    state::register(registry);
    control::register(registry);
    action::register(registry);
}
