// ABOUTME: Hierarchical context store shared by all tasks of one graph instance
// ABOUTME: Handles dotted-path resolution, awaitable placeholders, and {{ path }} substitution

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{EngineError, Result};

/// How a value lands at its destination path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteDiscipline {
    /// Replace whatever occupies the slot.
    Assign,
    /// Push onto an ordered sequence, creating it when absent.
    Append,
}

/// One node of the context tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "slot", content = "data", rename_all = "snake_case")]
pub enum Slot {
    Namespace(IndexMap<String, Slot>),
    Sequence(Vec<Slot>),
    /// Stand-in for the value of an outstanding awaitable, keyed by its id.
    Pending(String),
    Value(Value),
}

impl Slot {
    /// Plain JSON rendering; unresolved placeholders become `null`.
    pub fn to_value(&self) -> Value {
        match self {
            Slot::Namespace(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, slot)| (key.clone(), slot.to_value()))
                    .collect(),
            ),
            Slot::Sequence(items) => Value::Array(items.iter().map(Slot::to_value).collect()),
            Slot::Pending(_) => Value::Null,
            Slot::Value(value) => value.clone(),
        }
    }

    fn push(&mut self, item: Slot) -> bool {
        match self {
            Slot::Sequence(items) => {
                items.push(item);
                true
            }
            Slot::Value(Value::Array(values)) => {
                let mut items: Vec<Slot> = std::mem::take(values)
                    .into_iter()
                    .map(Slot::Value)
                    .collect();
                items.push(item);
                *self = Slot::Sequence(items);
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextStore {
    root: IndexMap<String, Slot>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from a JSON object. Keys containing `__` address nested paths.
    pub fn from_map(values: &Map<String, Value>) -> Result<Self> {
        let mut store = Self::new();
        store.merge(values)?;
        Ok(store)
    }

    pub fn merge(&mut self, values: &Map<String, Value>) -> Result<()> {
        for (key, value) in values {
            self.set(&key.replace("__", "."), value.clone())?;
        }
        Ok(())
    }

    /// Walk `path`, creating intermediate namespaces, and return the namespace
    /// holding the final segment together with that segment.
    pub fn resolve(&mut self, path: &str) -> Result<(&mut IndexMap<String, Slot>, String)> {
        let segments: Vec<&str> = path.split('.').collect();
        if let Some(empty) = segments.iter().find(|s| s.is_empty()) {
            return Err(EngineError::ContextPathConflict {
                path: path.to_string(),
                segment: empty.to_string(),
            });
        }

        let Some((last, parents)) = segments.split_last() else {
            return Err(EngineError::ContextPathConflict {
                path: path.to_string(),
                segment: String::new(),
            });
        };

        let mut namespace = &mut self.root;
        for segment in parents {
            let slot = namespace
                .entry(segment.to_string())
                .or_insert_with(|| Slot::Namespace(IndexMap::new()));

            // Plain objects written earlier become namespaces once addressed by path
            let converted = match slot {
                Slot::Value(Value::Object(map)) => Some(
                    map.iter()
                        .map(|(key, value)| (key.clone(), Slot::Value(value.clone())))
                        .collect::<IndexMap<_, _>>(),
                ),
                _ => None,
            };
            if let Some(entries) = converted {
                *slot = Slot::Namespace(entries);
            }

            namespace = match slot {
                Slot::Namespace(inner) => inner,
                _ => {
                    return Err(EngineError::ContextPathConflict {
                        path: path.to_string(),
                        segment: segment.to_string(),
                    })
                }
            };
        }

        Ok((namespace, last.to_string()))
    }

    pub fn write(&mut self, path: &str, slot: Slot, discipline: WriteDiscipline) -> Result<()> {
        let (namespace, key) = self.resolve(path)?;
        match discipline {
            WriteDiscipline::Assign => {
                namespace.insert(key, slot);
            }
            WriteDiscipline::Append => match namespace.get_mut(&key) {
                None => {
                    namespace.insert(key, Slot::Sequence(vec![slot]));
                }
                Some(existing) => {
                    if !existing.push(slot) {
                        return Err(EngineError::ContextPathConflict {
                            path: path.to_string(),
                            segment: key,
                        });
                    }
                }
            },
        }
        Ok(())
    }

    /// Assign a plain value at `path`.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        self.write(path, Slot::Value(value), WriteDiscipline::Assign)
    }

    /// Replace the placeholder for awaitable `id` inside the sequence at `path`,
    /// keeping its original position.
    pub fn replace_pending(&mut self, path: &str, id: &str, value: Value) -> Result<()> {
        let unresolved = || EngineError::UnresolvedAwaitable {
            id: id.to_string(),
            path: path.to_string(),
        };

        let (namespace, key) = self.resolve(path)?;
        let Some(Slot::Sequence(items)) = namespace.get_mut(&key) else {
            return Err(unresolved());
        };
        let position = items
            .iter()
            .position(|item| matches!(item, Slot::Pending(pending) if pending == id))
            .ok_or_else(unresolved)?;
        items[position] = Slot::Value(value);
        Ok(())
    }

    /// Read the value at `path`. Missing paths and unresolved placeholders read as `None`.
    pub fn get(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let mut slot = self.root.get(segments.next()?)?;
        let rest: Vec<&str> = segments.collect();

        let mut index = 0;
        loop {
            if index == rest.len() {
                return match slot {
                    Slot::Pending(_) => None,
                    other => Some(other.to_value()),
                };
            }
            slot = match slot {
                Slot::Namespace(entries) => entries.get(rest[index])?,
                Slot::Sequence(items) => items.get(rest[index].parse::<usize>().ok()?)?,
                Slot::Pending(_) => return None,
                Slot::Value(value) => return lookup(value, &rest[index..]),
            };
            index += 1;
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Replace `{{ path }}` strings with context values, recursing through mappings.
    pub fn substitute(&self, value: &Value) -> Value {
        match value {
            Value::String(text) => match context_reference(text) {
                Some(path) => self.get(path).unwrap_or(Value::Null),
                None => value.clone(),
            },
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, inner)| (key.clone(), self.substitute(inner)))
                    .collect(),
            ),
            _ => value.clone(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.root
                .iter()
                .map(|(key, slot)| (key.clone(), slot.to_value()))
                .collect(),
        )
    }
}

/// The path inside a string of the exact form `{{ path }}`.
pub fn context_reference(text: &str) -> Option<&str> {
    let inner = text
        .trim()
        .strip_prefix("{{")?
        .strip_suffix("}}")?
        .trim();
    if inner.is_empty() {
        None
    } else {
        Some(inner)
    }
}

fn lookup(value: &Value, segments: &[&str]) -> Option<Value> {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_creates_namespaces() {
        let mut ctx = ContextStore::new();
        ctx.set("a.b.c", json!(1)).unwrap();
        assert_eq!(ctx.get("a.b.c"), Some(json!(1)));
        assert_eq!(ctx.get("a"), Some(json!({"b": {"c": 1}})));
    }

    #[test]
    fn test_path_conflict() {
        let mut ctx = ContextStore::new();
        ctx.set("a", json!(5)).unwrap();
        let error = ctx.set("a.b", json!(1)).unwrap_err();
        assert!(matches!(error, EngineError::ContextPathConflict { .. }));
    }

    #[test]
    fn test_write_through_plain_object() {
        let mut ctx = ContextStore::new();
        ctx.set("cfg", json!({"x": 1})).unwrap();
        ctx.set("cfg.y", json!(2)).unwrap();
        assert_eq!(ctx.get("cfg"), Some(json!({"x": 1, "y": 2})));
    }

    #[test]
    fn test_append_preserves_registration_order() {
        let mut ctx = ContextStore::new();
        for id in ["A", "B", "C"] {
            ctx.write("jobs", Slot::Pending(id.to_string()), WriteDiscipline::Append)
                .unwrap();
        }

        ctx.replace_pending("jobs", "C", json!("C")).unwrap();
        ctx.replace_pending("jobs", "A", json!("A")).unwrap();
        assert_eq!(ctx.get("jobs"), Some(json!(["A", null, "C"])));

        ctx.replace_pending("jobs", "B", json!("B")).unwrap();
        assert_eq!(ctx.get("jobs"), Some(json!(["A", "B", "C"])));
    }

    #[test]
    fn test_replace_missing_placeholder() {
        let mut ctx = ContextStore::new();
        ctx.write("jobs", Slot::Pending("A".to_string()), WriteDiscipline::Append)
            .unwrap();
        let error = ctx.replace_pending("jobs", "Z", json!(1)).unwrap_err();
        assert!(matches!(error, EngineError::UnresolvedAwaitable { .. }));
    }

    #[test]
    fn test_append_onto_plain_array() {
        let mut ctx = ContextStore::from_map(json!({"items": [1, 2]}).as_object().unwrap())
            .unwrap();
        ctx.write("items", Slot::Value(json!(3)), WriteDiscipline::Append)
            .unwrap();
        assert_eq!(ctx.get("items"), Some(json!([1, 2, 3])));
        assert_eq!(ctx.get("items.1"), Some(json!(2)));
    }

    #[test]
    fn test_pending_reads_as_none() {
        let mut ctx = ContextStore::new();
        ctx.write("job", Slot::Pending("p1".to_string()), WriteDiscipline::Assign)
            .unwrap();
        assert_eq!(ctx.get("job"), None);
        assert_eq!(ctx.to_value(), json!({"job": null}));
    }

    #[test]
    fn test_substitute() {
        let ctx = ContextStore::from_map(
            json!({"n": 4, "run__label": "x"}).as_object().unwrap(),
        )
        .unwrap();

        assert_eq!(ctx.substitute(&json!("{{ n }}")), json!(4));
        assert_eq!(ctx.substitute(&json!("{{run.label}}")), json!("x"));
        assert_eq!(ctx.substitute(&json!("{{ missing }}")), json!(null));
        assert_eq!(ctx.substitute(&json!("n = {{ n }}")), json!("n = {{ n }}"));
        assert_eq!(
            ctx.substitute(&json!({"a": "{{ n }}", "b": {"c": "{{ n }}"}})),
            json!({"a": 4, "b": {"c": 4}})
        );
        assert_eq!(ctx.substitute(&json!(["{{ n }}"])), json!(["{{ n }}"]));
    }
}
