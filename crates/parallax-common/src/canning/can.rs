use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::object::{FunctionRef, Object};
use super::CanningConfig;

/// Function descriptor with canned default values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CannedFunction {
    pub module: String,
    pub name: String,
    pub defaults: Vec<Canned>,
}

/// Transportable form of an [`Object`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Canned {
    /// Leaf values pass through unchanged.
    Value(Object),
    List(Vec<Canned>),
    Tuple(Vec<Canned>),
    Dict(BTreeMap<String, Canned>),
    Function(CannedFunction),
    /// A container too large to walk, encoded whole.
    Opaque(Object),
}

/// Converts a live value into its transportable form.
///
/// Containers are canned element by element while they hold fewer than
/// `item_threshold` items; larger ones are kept opaque.
pub fn can(obj: &Object, config: &CanningConfig) -> Canned {
    match obj {
        Object::List(items) if items.len() < config.item_threshold => {
            Canned::List(items.iter().map(|o| can(o, config)).collect())
        }
        Object::Tuple(items) if items.len() < config.item_threshold => {
            Canned::Tuple(items.iter().map(|o| can(o, config)).collect())
        }
        Object::Dict(map) if map.len() < config.item_threshold => Canned::Dict(
            map.iter()
                .map(|(k, v)| (k.clone(), can(v, config)))
                .collect(),
        ),
        Object::List(_) | Object::Tuple(_) | Object::Dict(_) => Canned::Opaque(obj.clone()),
        Object::Function(f) => Canned::Function(CannedFunction {
            module: f.module.clone(),
            name: f.name.clone(),
            defaults: f.defaults.iter().map(|d| can(d, config)).collect(),
        }),
        other => Canned::Value(other.clone()),
    }
}

/// Reverses [`can`].
pub fn uncan(canned: Canned) -> Object {
    match canned {
        Canned::Value(obj) | Canned::Opaque(obj) => obj,
        Canned::List(items) => Object::List(items.into_iter().map(uncan).collect()),
        Canned::Tuple(items) => Object::Tuple(items.into_iter().map(uncan).collect()),
        Canned::Dict(map) => Object::Dict(map.into_iter().map(|(k, v)| (k, uncan(v))).collect()),
        Canned::Function(f) => Object::Function(FunctionRef {
            module: f.module,
            name: f.name,
            defaults: f.defaults.into_iter().map(uncan).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canning::NdArray;
    use bytes::Bytes;

    fn sample() -> Object {
        let mut dict = BTreeMap::new();
        dict.insert("x".to_string(), Object::Float(1.5));
        dict.insert("y".to_string(), Object::Str("hi".to_string()));
        Object::List(vec![
            Object::None,
            Object::Bool(true),
            Object::Int(-7),
            Object::Tuple(vec![Object::Int(1), Object::Bytes(Bytes::from_static(b"ab"))]),
            Object::Dict(dict),
            Object::Array(NdArray::from_f64(vec![2], &[1.0, 2.0]).unwrap()),
        ])
    }

    #[test]
    fn test_uncan_can_is_identity() {
        let config = CanningConfig::default();
        let obj = sample();
        assert_eq!(uncan(can(&obj, &config)), obj);
    }

    #[test]
    fn test_containers_recurse_under_threshold() {
        let config = CanningConfig::default();
        match can(&sample(), &config) {
            Canned::List(items) => {
                assert!(matches!(items[3], Canned::Tuple(_)));
                assert!(matches!(items[4], Canned::Dict(_)));
            }
            other => panic!("expected canned list, got {:?}", other),
        }
    }

    #[test]
    fn test_large_container_is_opaque() {
        let config = CanningConfig {
            item_threshold: 4,
            ..CanningConfig::default()
        };
        let big = Object::List((0..10).map(Object::Int).collect());
        let canned = can(&big, &config);
        assert!(matches!(canned, Canned::Opaque(_)));
        assert_eq!(uncan(canned), big);
    }

    #[test]
    fn test_function_defaults_are_canned() {
        let config = CanningConfig::default();
        let f = FunctionRef::new("m", "f")
            .with_defaults(vec![Object::List(vec![Object::Int(1)])]);
        let canned = can(&Object::Function(f.clone()), &config);
        match &canned {
            Canned::Function(cf) => {
                assert_eq!(cf.name, "f");
                assert!(matches!(cf.defaults[0], Canned::List(_)));
            }
            other => panic!("expected canned function, got {:?}", other),
        }
        assert_eq!(uncan(canned), Object::Function(f));
    }
}
