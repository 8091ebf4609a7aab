//! PropertyMap: the key-value store on operations, nodes and edges.

use std::collections::HashMap;

use super::Value;

/// A map of property names to values.
pub type PropertyMap = HashMap<String, Value>;

/// Build a [`PropertyMap`] from literal pairs.
///
/// ```
/// use horizon::{props, Value};
///
/// let p = props! { "dim" => 8, "angle" => 0.5 };
/// assert_eq!(p.get("dim"), Some(&Value::Int(8)));
/// ```
#[macro_export]
macro_rules! props {
    () => { $crate::PropertyMap::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::PropertyMap::new();
        $( map.insert(::std::string::String::from($key), $crate::Value::from($value)); )+
        map
    }};
}
