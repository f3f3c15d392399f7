//! Transducer algebra: stages, reducers, lazy sources and the two drivers.

mod buffer;
mod drivers;
mod reducers;
mod sources;
mod stages;

pub use drivers::{compose, transduce, transform_items};
pub use reducers::{chain, collect, reduced, stage_step, unreduced};
pub use sources::{iter_done, iter_item, list_cursor, range};
pub use stages::{count, filter, first, last, map, skip, take, take_while};

use crate::registry::Registry;

pub(crate) fn register(registry: &mut Registry) {
    buffer::register(registry);
    reducers::register(registry);
    stages::register(registry);
    sources::register(registry);
    drivers::register(registry);
}
