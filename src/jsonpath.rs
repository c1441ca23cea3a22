//! JSON-path access into record documents.
//!
//! Paths are tokenized on `.`, `[` and `]`; empty segments are dropped and
//! integer segments address list indices. Negative indices count from the
//! end on reads. Writes create missing intermediate containers, choosing
//! object vs list from the shape of the next token, and pad lists with
//! null when writing past the end.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Key(String),
    Index(i64),
}

fn tokenize(path: &str) -> Vec<Token> {
    path.split(['.', '[', ']'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i64>()
                .map_or_else(|_| Token::Key(part.to_owned()), Token::Index)
        })
        .collect()
}

fn resolve_index(len: usize, index: i64) -> Option<usize> {
    if index >= 0 {
        Some(index as usize)
    } else {
        len.checked_sub(index.unsigned_abs() as usize)
    }
}

/// Read the value at `path`. `None` path addresses the whole document;
/// any absent intermediate segment yields `None`.
pub fn get<'a>(data: &'a Value, path: Option<&str>) -> Option<&'a Value> {
    let mut node = data;
    let Some(path) = path else {
        return Some(data);
    };
    for token in tokenize(path) {
        node = match token {
            Token::Key(key) => node.as_object()?.get(&key)?,
            Token::Index(index) => {
                let list = node.as_array()?;
                list.get(resolve_index(list.len(), index)?)?
            }
        };
    }
    Some(node)
}

/// Read an owned copy of the value at `path`.
pub fn get_owned(data: &Value, path: Option<&str>) -> Option<Value> {
    get(data, path).cloned()
}

/// Return a copy of `data` with `value` written at `path`. An empty or
/// absent path replaces the whole document.
pub fn set(data: &Value, path: Option<&str>, value: Value) -> Value {
    let tokens = path.map(tokenize).unwrap_or_default();
    if tokens.is_empty() {
        return value;
    }
    let mut doc = data.clone();
    write(&mut doc, &tokens, Some(value));
    doc
}

/// Return a copy of `data` with the final segment of `path` removed
/// (map key removed, list element spliced out).
pub fn delete(data: &Value, path: &str) -> Value {
    let tokens = tokenize(path);
    if tokens.is_empty() {
        return Value::Null;
    }
    let mut doc = data.clone();
    write(&mut doc, &tokens, None);
    doc
}

/// Walk to the final token, creating containers along the way, then write
/// (`Some`) or delete (`None`) the leaf.
fn write(node: &mut Value, tokens: &[Token], value: Option<Value>) {
    let (token, rest) = tokens.split_first().expect("tokens checked non-empty");

    if rest.is_empty() {
        write_leaf(node, token, value);
        return;
    }

    let next_is_index = matches!(rest[0], Token::Index(_));
    let child = match token {
        Token::Key(key) => descend_object(node, key, next_is_index),
        // Integer segments on an object address the stringified key.
        Token::Index(index) if node.is_object() => {
            descend_object(node, &index.to_string(), next_is_index)
        }
        Token::Index(index) => {
            let Some(child) = descend_list(node, *index, next_is_index) else {
                return;
            };
            child
        }
    };
    write(child, rest, value);
}

fn descend_object<'a>(node: &'a mut Value, key: &str, next_is_index: bool) -> &'a mut Value {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let map = node.as_object_mut().expect("coerced to object");
    let entry = map.entry(key.to_owned()).or_insert(Value::Null);
    fix_shape(entry, next_is_index);
    entry
}

fn descend_list(node: &mut Value, index: i64, next_is_index: bool) -> Option<&mut Value> {
    if !node.is_array() {
        *node = Value::Array(Vec::new());
    }
    let list = node.as_array_mut().expect("coerced to list");
    let idx = resolve_index(list.len(), index)?;
    if idx >= list.len() {
        list.resize(idx + 1, Value::Null);
    }
    let entry = &mut list[idx];
    fix_shape(entry, next_is_index);
    Some(entry)
}

/// Make an intermediate node traversable: lists for index tokens, objects
/// for key tokens. Existing containers of the right shape are kept.
fn fix_shape(entry: &mut Value, next_is_index: bool) {
    if next_is_index {
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
    } else if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
}

fn write_leaf(node: &mut Value, token: &Token, value: Option<Value>) {
    match token {
        Token::Key(key) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            let map = node.as_object_mut().expect("coerced to object");
            match value {
                Some(v) => {
                    map.insert(key.clone(), v);
                }
                None => {
                    map.remove(key);
                }
            }
        }
        Token::Index(index) => {
            if !node.is_array() {
                *node = Value::Array(Vec::new());
            }
            let list = node.as_array_mut().expect("coerced to list");
            let Some(idx) = resolve_index(list.len(), *index) else {
                return;
            };
            match value {
                Some(v) => {
                    if idx >= list.len() {
                        list.resize(idx + 1, Value::Null);
                    }
                    list[idx] = v;
                }
                None => {
                    if idx < list.len() {
                        list.remove(idx);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "firstname": "yasser",
            "lastname": "fadl",
            "address": { "street": "currentStreet" },
            "pastAddresses": [
                { "street": "firststreet", "postCode": 1001 },
                { "street": "secondstreet", "postCode": 2002 }
            ]
        })
    }

    #[test]
    fn get_simple_and_nested_paths() {
        let d = doc();
        assert_eq!(get(&d, Some("firstname")), Some(&json!("yasser")));
        assert_eq!(get(&d, Some("address.street")), Some(&json!("currentStreet")));
        assert_eq!(
            get(&d, Some("pastAddresses[1].street")),
            Some(&json!("secondstreet"))
        );
        assert_eq!(get(&d, None), Some(&d));
    }

    #[test]
    fn get_negative_index_counts_from_end() {
        let d = doc();
        assert_eq!(
            get(&d, Some("pastAddresses[-1].postCode")),
            Some(&json!(2002))
        );
        assert_eq!(get(&d, Some("pastAddresses[-3]")), None);
    }

    #[test]
    fn get_missing_segments_yield_none() {
        let d = doc();
        assert_eq!(get(&d, Some("doesNotExist")), None);
        assert_eq!(get(&d, Some("address.number")), None);
        assert_eq!(get(&d, Some("pastAddresses[8].street")), None);
        assert_eq!(get(&d, Some("firstname.sub")), None);
    }

    #[test]
    fn set_overwrites_in_place() {
        let d = set(&doc(), Some("firstname"), json!("wolfram"));
        assert_eq!(get(&d, Some("firstname")), Some(&json!("wolfram")));
        assert_eq!(get(&d, Some("lastname")), Some(&json!("fadl")));
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let d = set(&json!({}), Some("a.b.c"), json!(5));
        assert_eq!(d, json!({"a": {"b": {"c": 5}}}));
    }

    #[test]
    fn set_creates_intermediate_lists() {
        let d = set(&json!({}), Some("items[1].label"), json!("x"));
        assert_eq!(d, json!({"items": [null, {"label": "x"}]}));
    }

    #[test]
    fn set_pads_lists_with_null() {
        let d = set(&json!({"l": [1]}), Some("l[3]"), json!(9));
        assert_eq!(d, json!({"l": [1, null, null, 9]}));
    }

    #[test]
    fn set_whole_document() {
        assert_eq!(set(&doc(), None, json!({"fresh": true})), json!({"fresh": true}));
        assert_eq!(set(&doc(), Some(""), json!(3)), json!(3));
    }

    #[test]
    fn set_does_not_mutate_the_source() {
        let original = doc();
        let _ = set(&original, Some("address.street"), json!("elsewhere"));
        assert_eq!(original, doc());
    }

    #[test]
    fn delete_removes_keys_and_elements() {
        let d = delete(&doc(), "address.street");
        assert_eq!(get(&d, Some("address")), Some(&json!({})));

        let d = delete(&doc(), "pastAddresses[0]");
        assert_eq!(
            get(&d, Some("pastAddresses[0].street")),
            Some(&json!("secondstreet"))
        );
    }

    #[test]
    fn set_then_get_roundtrips() {
        let paths = ["a", "a.b", "list[0]", "list[2].x", "deep.er[1][0]"];
        for path in paths {
            let d = set(&json!({}), Some(path), json!("v"));
            assert_eq!(get(&d, Some(path)), Some(&json!("v")), "path {path}");
        }
    }
}
