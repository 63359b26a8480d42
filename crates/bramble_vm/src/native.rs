use std::time::{SystemTime, UNIX_EPOCH};

use crate::value::Value;

/// `clock()` — seconds since the Unix epoch as a float, matching the
/// reference implementation's native clock. The only native function
/// this language guarantees; `Vm::new` registers it at construction.
pub fn clock(_args: &[Value]) -> Result<Value, String> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map_err(|e| e.to_string())?;
    Ok(Value::Number(now.as_secs_f64()))
}
