//! The tagged scalar that flows through stacks, registers, data and
//! literal command arguments.

use crate::error::{VmError, VmResult};

/// The tag that selects a `Value`'s active variant. Transported
/// separately from the value itself across the native ABI boundary
/// (see `codegen`), matching the `out_tag` slot in the calling contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Integer,
    Float,
    /// No value, or a value that has not yet been assigned.
    Uninitialised,
}

impl ValueType {
    /// The byte used to tag a `ValueType` across the ABI boundary and in
    /// the bytecode format's `Command::type` field.
    pub fn as_u8(self) -> u8 {
        match self {
            ValueType::Integer => 0,
            ValueType::Float => 1,
            ValueType::Uninitialised => 2,
        }
    }

    pub fn from_u8(b: u8) -> VmResult<Self> {
        match b {
            0 => Ok(ValueType::Integer),
            1 => Ok(ValueType::Float),
            2 => Ok(ValueType::Uninitialised),
            _ => Err(VmError::format_error(format!("unknown value type byte {b}"))),
        }
    }
}

/// A tagged scalar: an integer, a float, or nothing at all.
///
/// Every read of a `Value` must either name the tag it expects (`expect`,
/// `get_into`) or explicitly allow an uninitialised value through; a
/// mismatch is a `TypeError`, never a silent coercion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Uninitialised,
}

impl Default for Value {
    fn default() -> Self {
        Value::Uninitialised
    }
}

impl Value {
    pub fn new(tag: ValueType) -> Self {
        match tag {
            ValueType::Integer => Value::Integer(0),
            ValueType::Float => Value::Float(0.0),
            ValueType::Uninitialised => Value::Uninitialised,
        }
    }

    pub fn from_int(v: i64) -> Self {
        Value::Integer(v)
    }

    pub fn from_fp(v: f64) -> Self {
        Value::Float(v)
    }

    pub fn tag(&self) -> ValueType {
        match self {
            Value::Integer(_) => ValueType::Integer,
            Value::Float(_) => ValueType::Float,
            Value::Uninitialised => ValueType::Uninitialised,
        }
    }

    /// Assert that `self` carries `tag`, optionally allowing
    /// `Uninitialised` through regardless of `tag`.
    pub fn expect(&self, tag: ValueType, allow_uninit: bool) -> VmResult<&Value> {
        if allow_uninit && matches!(self, Value::Uninitialised) {
            return Ok(self);
        }
        if self.tag() == tag {
            Ok(self)
        } else {
            Err(VmError::TypeError {
                expected: tag,
                found: self.tag(),
            })
        }
    }

    /// Read `self` as an `i64`, failing with `TypeError` on a tag
    /// mismatch (uninitialised values are never silently accepted here).
    pub fn get_into_int(&self) -> VmResult<i64> {
        match self.expect(ValueType::Integer, false)? {
            Value::Integer(v) => Ok(*v),
            _ => unreachable!(),
        }
    }

    pub fn get_into_fp(&self) -> VmResult<f64> {
        match self.expect(ValueType::Float, false)? {
            Value::Float(v) => Ok(*v),
            _ => unreachable!(),
        }
    }

    pub fn set_from(&mut self, tag: ValueType, src: &Value) -> VmResult<()> {
        src.expect(tag, false)?;
        *self = *src;
        Ok(())
    }

    /// Pack into the 8-byte ABI encoding used across the native call
    /// boundary: for `Integer`, the low 64 bits of the two's-complement
    /// representation; for `Float`, the raw `f64` bit pattern.
    pub fn to_abi(&self) -> u64 {
        match self {
            Value::Integer(v) => *v as u64,
            Value::Float(v) => v.to_bits(),
            Value::Uninitialised => 0,
        }
    }

    pub fn set_from_abi(bits: u64, tag: ValueType) -> Self {
        match tag {
            ValueType::Integer => Value::Integer(bits as i64),
            ValueType::Float => Value::Float(f64::from_bits(bits)),
            ValueType::Uninitialised => Value::Uninitialised,
        }
    }

    /// Parse an integer literal, following the same "no NaN, no
    /// infinity, no subnormals" discipline the assembly-format float
    /// parser uses (there is no subnormal/NaN concept for integers, but
    /// overflow is rejected rather than silently truncated).
    pub fn parse_int(text: &str) -> VmResult<Self> {
        text.trim()
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|e| VmError::format_error(format!("invalid integer literal {text:?}: {e}")))
    }

    /// Parse a floating-point literal, rejecting NaN, infinity and
    /// subnormal values the way a `strtof`-plus-`fpclassify` filter would.
    pub fn parse_fp(text: &str) -> VmResult<Self> {
        let v: f64 = text
            .trim()
            .parse()
            .map_err(|e| VmError::format_error(format!("invalid float literal {text:?}: {e}")))?;
        if v.is_nan() || v.is_infinite() || (v != 0.0 && v.is_subnormal()) {
            return Err(VmError::format_error(format!(
                "float literal {text:?} is NaN, infinite or subnormal"
            )));
        }
        Ok(Value::Float(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_roundtrip_integer() {
        let v = Value::Integer(-42);
        assert_eq!(Value::set_from_abi(v.to_abi(), ValueType::Integer), v);
    }

    #[test]
    fn abi_roundtrip_float() {
        let v = Value::Float(3.25);
        assert_eq!(Value::set_from_abi(v.to_abi(), ValueType::Float), v);
    }

    #[test]
    fn expect_rejects_mismatched_tag() {
        let v = Value::Integer(1);
        assert!(matches!(
            v.expect(ValueType::Float, false),
            Err(VmError::TypeError { .. })
        ));
    }

    #[test]
    fn expect_allows_uninitialised_override() {
        let v = Value::Uninitialised;
        assert!(v.expect(ValueType::Integer, true).is_ok());
        assert!(v.expect(ValueType::Integer, false).is_err());
    }

    #[test]
    fn parse_fp_rejects_nan_and_infinity() {
        assert!(Value::parse_fp("nan").is_err());
        assert!(Value::parse_fp("inf").is_err());
        assert!(Value::parse_fp("3.5").is_ok());
    }
}
