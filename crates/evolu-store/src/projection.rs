//! In-memory materialized latest-value projection (§4.5).
//!
//! For each `(table, id)` row, the projection tracks the winning value and
//! timestamp per column, so answering a read never requires re-scanning the
//! history log.

use evolu_core::identifiers::RowId;
use evolu_core::time::Timestamp;
use evolu_core::types::{ColumnName, TableName, Value};
use std::collections::BTreeMap;

type RowKey = (TableName, RowId);

/// Materialized projection over a single owner's history.
#[derive(Debug, Default)]
pub struct Projection {
    rows: BTreeMap<RowKey, BTreeMap<ColumnName, (Value, Timestamp)>>,
}

impl Projection {
    /// An empty projection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a single column write if `ts` dominates the column's current
    /// winner, or if the column has no winner yet. Returns `true` if the
    /// projection changed (I2: last-writer-wins per column).
    pub fn apply(&mut self, table: &TableName, id: &RowId, column: &ColumnName, value: Value, ts: &Timestamp) -> bool {
        let key = (table.clone(), id.clone());
        let row = self.rows.entry(key).or_default();
        let wins = match row.get(column) {
            Some((_, existing)) => ts > existing,
            None => true,
        };
        if wins {
            row.insert(column.clone(), (value, ts.clone()));
        }
        wins
    }

    /// Current value of every column of `(table, id)`, if the row has any
    /// recorded writes.
    pub fn get_row(&self, table: &TableName, id: &RowId) -> Option<BTreeMap<ColumnName, Value>> {
        self.rows.get(&(table.clone(), id.clone())).map(flatten)
    }

    /// Every row of `table` whose current projection satisfies `predicate`.
    pub fn query_table(
        &self,
        table: &TableName,
        predicate: impl Fn(&BTreeMap<ColumnName, Value>) -> bool,
    ) -> Vec<(RowId, BTreeMap<ColumnName, Value>)> {
        self.rows
            .iter()
            .filter(|((t, _), _)| t == table)
            .filter_map(|((_, id), cols)| {
                let values = flatten(cols);
                predicate(&values).then(|| (id.clone(), values))
            })
            .collect()
    }
}

fn flatten(cols: &BTreeMap<ColumnName, (Value, Timestamp)>) -> BTreeMap<ColumnName, Value> {
    cols.iter().map(|(c, (v, _))| (c.clone(), v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use evolu_core::identifiers::NodeId;

    fn ts(millis: i64, counter: u16) -> Timestamp {
        Timestamp {
            millis,
            counter,
            node_id: NodeId::generate([1; 8]),
        }
    }

    #[test]
    fn later_write_wins() {
        let mut p = Projection::new();
        let id = RowId::new("row-1");
        let table = "todos".to_string();

        p.apply(&table, &id, &"title".to_string(), Value::Text("a".into()), &ts(1, 0));
        p.apply(&table, &id, &"title".to_string(), Value::Text("b".into()), &ts(2, 0));

        let row = p.get_row(&table, &id).unwrap();
        assert_eq!(row.get("title"), Some(&Value::Text("b".into())));
    }

    #[test]
    fn earlier_write_after_later_does_not_win() {
        let mut p = Projection::new();
        let id = RowId::new("row-1");
        let table = "todos".to_string();

        p.apply(&table, &id, &"title".to_string(), Value::Text("b".into()), &ts(2, 0));
        let changed = p.apply(&table, &id, &"title".to_string(), Value::Text("a".into()), &ts(1, 0));

        assert!(!changed);
        let row = p.get_row(&table, &id).unwrap();
        assert_eq!(row.get("title"), Some(&Value::Text("b".into())));
    }

    #[test]
    fn query_table_filters_by_predicate() {
        let mut p = Projection::new();
        let table = "todos".to_string();

        p.apply(&table, &RowId::new("a"), &"done".to_string(), Value::Integer(0), &ts(1, 0));
        p.apply(&table, &RowId::new("b"), &"done".to_string(), Value::Integer(1), &ts(1, 0));

        let done: Vec<_> = p
            .query_table(&table, |row| row.get("done") == Some(&Value::Integer(1)))
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        assert_eq!(done, vec![RowId::new("b")]);
    }
}
