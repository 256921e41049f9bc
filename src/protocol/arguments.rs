use serde_json::{Map, Value};

use crate::CallArgs;

/// What to do with a non-empty mapping payload whose `args` and `kwargs`
/// both come out empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KwargsFallback {
    /// Pass the whole mapping as the named arguments.
    #[default]
    WholePayload,
    /// Call with no arguments.
    Disabled,
}

/// Turn a decoded request body into call arguments.
///
/// `decoded` is `None` when the body failed to decode; the handler then
/// gets no arguments. Otherwise:
///
/// - a sequence is the positional arguments;
/// - a mapping supplies `args` (a non-sequence value becomes a one-element
///   list) and `kwargs` (a non-mapping value becomes `{"kwargs": value}`),
///   with `fallback` deciding what an otherwise empty result means;
/// - any other value yields an `ErrorInfo` named argument describing it.
pub fn extract_arguments(decoded: Option<Value>, body: &[u8], fallback: KwargsFallback) -> CallArgs {
    // ---
    let Some(decoded) = decoded else {
        return CallArgs::default();
    };

    match decoded {
        Value::Array(args) => CallArgs {
            args,
            kwargs: Map::new(),
        },
        Value::Object(map) => {
            let args = match map.get("args") {
                None => Vec::new(),
                Some(Value::Array(a)) => a.clone(),
                Some(other) => vec![other.clone()],
            };
            let kwargs = match map.get("kwargs") {
                None => Map::new(),
                Some(Value::Object(k)) => k.clone(),
                Some(other) => {
                    let mut wrapped = Map::new();
                    wrapped.insert("kwargs".to_string(), other.clone());
                    wrapped
                }
            };

            // Applies to the empty envelope too: `{"args": [], "kwargs": {}}`
            // arrives as those two named arguments.
            if args.is_empty() && kwargs.is_empty() && !map.is_empty() && fallback == KwargsFallback::WholePayload {
                return CallArgs {
                    args: Vec::new(),
                    kwargs: map,
                };
            }

            CallArgs { args, kwargs }
        }
        other => {
            let mut kwargs = Map::new();
            kwargs.insert(
                "ErrorInfo".to_string(),
                Value::String(format!(
                    "Invalid parameters, original arguments: {other}, original body: {:?}",
                    String::from_utf8_lossy(body)
                )),
            );
            CallArgs {
                args: Vec::new(),
                kwargs,
            }
        }
    }
}
