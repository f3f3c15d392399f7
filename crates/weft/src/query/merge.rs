//! Merging QuerySets and projecting merged results back.
//!
//! Entries merge when their operation and tolerance are equal; their
//! children then merge recursively. Each input set keeps a projection tree
//! recording where its entries landed, so one merged resolution can be fanned
//! out to every requester in its original shape.

use super::set::{QuerySet, QuerySetEntry, QuerySetOp};
use crate::value::Value;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Shape {
    Value,
    Nested(Vec<Projection>),
    /// One nested list per item.
    Items(Vec<Projection>),
}

/// Where one requested entry lives in the merged set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Projection {
    pub index: usize,
    pub shape: Shape,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Merged {
    pub set: QuerySet,
    /// One projection list per input set, in input order.
    pub projections: Vec<Vec<Projection>>,
}

pub fn merge(sets: &[QuerySet]) -> Merged {
    let mut entries = Vec::new();
    let projections = sets
        .iter()
        .map(|set| {
            set.entries
                .iter()
                .map(|entry| merge_into(&mut entries, entry))
                .collect()
        })
        .collect();
    Merged {
        set: QuerySet { entries },
        projections,
    }
}

fn merge_into(target: &mut Vec<QuerySetEntry>, entry: &QuerySetEntry) -> Projection {
    let index = match target
        .iter()
        .position(|existing| existing.op == entry.op && existing.tolerance == entry.tolerance)
    {
        Some(index) => index,
        None => {
            target.push(QuerySetEntry {
                op: entry.op.clone(),
                children: Vec::new(),
                tolerance: entry.tolerance,
            });
            target.len() - 1
        }
    };
    let children: Vec<Projection> = entry
        .children
        .iter()
        .map(|child| merge_into(&mut target[index].children, child))
        .collect();
    let shape = match entry.op {
        QuerySetOp::Value => Shape::Value,
        QuerySetOp::Items { .. } => Shape::Items(children),
        _ => Shape::Nested(children),
    };
    Projection { index, shape }
}

/// Results of one input set, cut out of the merged `results`.
pub fn project(results: &Value, projections: &[Projection]) -> Value {
    let Some(items) = results.as_list() else {
        return results.clone();
    };
    Value::list(projections.iter().map(|projection| {
        let result = items.get(projection.index).cloned().unwrap_or_default();
        match &projection.shape {
            Shape::Value => result,
            Shape::Nested(children) => project(&result, children),
            Shape::Items(children) => match result.as_list() {
                Some(rows) => Value::list(rows.iter().map(|row| project(row, children))),
                None => result,
            },
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::set::Tolerance;

    fn name_of(user: &str) -> QuerySetEntry {
        QuerySetEntry::child(user, [QuerySetEntry::child("name", [QuerySetEntry::value()])])
    }

    #[test]
    fn identical_entries_merge_once() {
        let a = QuerySet::new([name_of("ada")]);
        let b = QuerySet::new([name_of("ada"), name_of("bob")]);
        let merged = merge(&[a.clone(), b]);
        assert_eq!(merged.set.entries.len(), 2);
        assert_eq!(merged.set.entries[0], name_of("ada"));
        assert_eq!(merged.projections[0][0].index, 0);
        assert_eq!(merged.projections[1][1].index, 1);

        // A set merged with itself is unchanged.
        assert_eq!(merge(&[a.clone(), a.clone()]).set, a);
    }

    #[test]
    fn differing_tolerance_stays_apart() {
        let strict = QuerySet::new([QuerySetEntry::value()]);
        let lenient = QuerySet::new([QuerySetEntry::value().with_tolerance(Tolerance {
            allow_errors: true,
            allow_pending: true,
        })]);
        assert_eq!(merge(&[strict, lenient]).set.entries.len(), 2);
    }

    #[test]
    fn projection_restores_each_shape() {
        let a = QuerySet::new([QuerySetEntry::child("x", [QuerySetEntry::value()])]);
        let b = QuerySet::new([
            QuerySetEntry::child("y", [QuerySetEntry::value()]),
            QuerySetEntry::child("x", [QuerySetEntry::value()]),
        ]);
        let merged = merge(&[a, b]);
        let results = Value::list([
            Value::list([Value::number(1.0)]),
            Value::list([Value::number(2.0)]),
        ]);
        assert_eq!(
            project(&results, &merged.projections[0]),
            Value::list([Value::list([Value::number(1.0)])])
        );
        assert_eq!(
            project(&results, &merged.projections[1]),
            Value::list([
                Value::list([Value::number(2.0)]),
                Value::list([Value::number(1.0)]),
            ])
        );
    }

    #[test]
    fn items_project_per_row() {
        let wide = QuerySet::new([QuerySetEntry::items([
            QuerySetEntry::child("a", [QuerySetEntry::value()]),
            QuerySetEntry::child("b", [QuerySetEntry::value()]),
        ])]);
        let narrow = QuerySet::new([QuerySetEntry::items([QuerySetEntry::child(
            "b",
            [QuerySetEntry::value()],
        )])]);
        let merged = merge(&[wide, narrow]);
        assert_eq!(merged.set.entries.len(), 1);
        let row = Value::list([Value::list([Value::Nil]), Value::list([Value::Bool(true)])]);
        let results = Value::list([Value::list([row])]);
        assert_eq!(
            project(&results, &merged.projections[1]),
            Value::list([Value::list([Value::list([Value::list([Value::Bool(true)])])])])
        );
    }
}
