//! Append-only item buffers for accumulators growing one step at a time.
//!
//! A `buffer` definition names a prefix of a shared log. Appending at the
//! end of the log extends it in place; appending to an older prefix forks a
//! copy. Either way a definition keeps denoting the same items, and building
//! the next one costs the appended items only.

use crate::error::NodeError;
use crate::node::{NodeDefinition, Opaque, Prop};
use crate::registry::{NodeType, PropKind, Registry};
use crate::value::Value;
use std::cell::RefCell;
use std::rc::Rc;

pub const BUFFER: &str = "buffer";

#[derive(Default)]
struct ItemLog(RefCell<Vec<NodeDefinition>>);

fn prefix(log: Rc<ItemLog>, len: usize) -> NodeDefinition {
    NodeDefinition::new(
        BUFFER,
        [
            ("log", Prop::Opaque(Opaque::from_rc(log))),
            ("len", Prop::Value(Value::number(len as f64))),
        ],
    )
}

fn parts(buffer: &NodeDefinition) -> Result<(Rc<ItemLog>, usize), NodeError> {
    if buffer.tag() != BUFFER {
        return Err(NodeError::mismatch(
            "step",
            "a buffer accumulator",
            format!("`{}`", buffer.tag()),
        ));
    }
    let log = buffer.opaque_prop::<ItemLog>("log")?;
    let len = buffer.number_prop("len")? as usize;
    Ok((log, len))
}

pub(crate) fn empty() -> NodeDefinition {
    prefix(Rc::default(), 0)
}

/// `buffer` followed by `items`.
pub(crate) fn append(
    buffer: &NodeDefinition,
    items: impl IntoIterator<Item = NodeDefinition>,
) -> Result<NodeDefinition, NodeError> {
    let (mut log, mut len) = parts(buffer)?;
    for item in items {
        let forked = {
            let mut entries = log.0.borrow_mut();
            if entries.len() <= len {
                entries.push(item);
                None
            } else if entries[len] == item {
                // Recomputing a step that already ran: the entry is there.
                None
            } else {
                let mut copy = entries[..len].to_vec();
                copy.push(item);
                Some(copy)
            }
        };
        if let Some(copy) = forked {
            log = Rc::new(ItemLog(RefCell::new(copy)));
        }
        len += 1;
    }
    Ok(prefix(log, len))
}

/// The items `buffer` denotes.
pub(crate) fn items(buffer: &NodeDefinition) -> Result<Vec<NodeDefinition>, NodeError> {
    let (log, len) = parts(buffer)?;
    let entries = log.0.borrow();
    Ok(entries.iter().take(len).cloned().collect())
}

pub(crate) fn register(registry: &mut Registry) {
    registry.register(
        NodeType::new(BUFFER)
            .prop("log", PropKind::Opaque)
            .prop("len", PropKind::Value),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::data;

    fn numbers(buffer: &NodeDefinition) -> Vec<f64> {
        items(buffer)
            .unwrap()
            .iter()
            .filter_map(|item| item.to_value().and_then(|value| value.as_number()))
            .collect()
    }

    #[test]
    fn appending_at_the_tip_shares_the_log() {
        let one = append(&empty(), [data::value(1.0)]).unwrap();
        let two = append(&one, [data::value(2.0)]).unwrap();
        assert_eq!(one.prop("log"), two.prop("log"));
        assert_eq!(numbers(&one), [1.0]);
        assert_eq!(numbers(&two), [1.0, 2.0]);
    }

    #[test]
    fn replaying_a_step_yields_the_same_definition() {
        let one = append(&empty(), [data::value(1.0)]).unwrap();
        let first = append(&one, [data::value(2.0)]).unwrap();
        let again = append(&one, [data::value(2.0)]).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn diverging_appends_fork() {
        let one = append(&empty(), [data::value(1.0)]).unwrap();
        let left = append(&one, [data::value(2.0)]).unwrap();
        let right = append(&one, [data::value(3.0), data::value(4.0)]).unwrap();
        assert_ne!(left.prop("log"), right.prop("log"));
        assert_eq!(numbers(&left), [1.0, 2.0]);
        assert_eq!(numbers(&right), [1.0, 3.0, 4.0]);
        assert_eq!(numbers(&one), [1.0]);
    }

    #[test]
    fn only_buffers_are_accepted() {
        assert!(append(&data::list([]), [data::nil()]).is_err());
    }
}
