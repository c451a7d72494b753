// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The structured-clone boundary: conversions between V8 values and
//! JSON-safe data. Primitives, plain records, and arrays cross; anything
//! else (functions, symbols, host objects, NaN/Infinity) is refused.

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Cap on conversion recursion. A script can build arbitrarily deep (or
/// cyclic) structures; past this depth we refuse rather than recurse.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("value of this type cannot cross the sandbox boundary")]
    Unrepresentable,
    #[error("non-finite number cannot cross the sandbox boundary")]
    NonFiniteNumber,
    #[error("structure exceeds maximum depth {MAX_DEPTH}")]
    TooDeep,
}

pub fn json_to_v8<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &Value,
) -> v8::Local<'s, v8::Value> {
    match value {
        Value::Null => v8::null(scope).into(),
        Value::Bool(b) => v8::Boolean::new(scope, *b).into(),
        Value::Number(n) => {
            let f = n.as_f64().unwrap_or(0.0);
            v8::Number::new(scope, f).into()
        }
        Value::String(s) => v8::String::new(scope, s)
            .map(Into::into)
            .unwrap_or_else(|| v8::null(scope).into()),
        Value::Array(items) => {
            let array = v8::Array::new(scope, items.len() as i32);
            for (i, item) in items.iter().enumerate() {
                let v = json_to_v8(scope, item);
                array.set_index(scope, i as u32, v);
            }
            array.into()
        }
        Value::Object(map) => {
            let obj = v8::Object::new(scope);
            for (k, item) in map {
                let Some(key) = v8::String::new(scope, k) else {
                    continue;
                };
                let v = json_to_v8(scope, item);
                obj.set(scope, key.into(), v);
            }
            obj.into()
        }
    }
}

pub fn v8_to_json(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
) -> Result<Value, ConvertError> {
    v8_to_json_depth(scope, value, 0)
}

fn v8_to_json_depth(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
    depth: usize,
) -> Result<Value, ConvertError> {
    if depth > MAX_DEPTH {
        return Err(ConvertError::TooDeep);
    }

    if value.is_null() || value.is_undefined() {
        return Ok(Value::Null);
    }
    if value.is_boolean() {
        return Ok(Value::Bool(value.is_true()));
    }
    if value.is_number() {
        let f = value.number_value(scope).unwrap_or(f64::NAN);
        if !f.is_finite() {
            return Err(ConvertError::NonFiniteNumber);
        }
        // Integral values come back as integers so persistence
        // round-trips stay structural.
        if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
            return Ok(Value::Number(Number::from(f as i64)));
        }
        return Ok(Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null));
    }
    if value.is_string() {
        let s = value.to_rust_string_lossy(scope);
        return Ok(Value::String(s));
    }
    if value.is_array() {
        let array = v8::Local::<v8::Array>::try_from(value)
            .map_err(|_| ConvertError::Unrepresentable)?;
        let len = array.length();
        let mut items = Vec::with_capacity(len as usize);
        for i in 0..len {
            let Some(item) = array.get_index(scope, i) else {
                items.push(Value::Null);
                continue;
            };
            items.push(v8_to_json_depth(scope, item, depth + 1)?);
        }
        return Ok(Value::Array(items));
    }
    if value.is_function() || value.is_symbol() {
        return Err(ConvertError::Unrepresentable);
    }
    if value.is_object() {
        let obj = v8::Local::<v8::Object>::try_from(value)
            .map_err(|_| ConvertError::Unrepresentable)?;
        let Some(names) =
            obj.get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
        else {
            return Ok(Value::Object(Map::new()));
        };
        let mut map = Map::new();
        for i in 0..names.length() {
            let Some(key) = names.get_index(scope, i) else {
                continue;
            };
            let key_str = key.to_rust_string_lossy(scope);
            let Some(item) = obj.get(scope, key) else {
                continue;
            };
            map.insert(key_str, v8_to_json_depth(scope, item, depth + 1)?);
        }
        return Ok(Value::Object(map));
    }

    Err(ConvertError::Unrepresentable)
}
