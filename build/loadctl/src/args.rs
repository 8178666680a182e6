// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Argument marshalling and array sync-back.
//!
//! A call takes a sequence of typed host values matching the parsed
//! signature. Scalars are packed into their slots — one slot each,
//! bottom-aligned, floats as bit patterns. Arrays are flattened, placed in
//! a transient device region, and passed by device address; when sync is
//! enabled (the default) their device contents are read back into the host
//! array after the call, so loaded code can mutate caller data in place.
//!
//! Typing is strict: a parameter declared `int16_t` takes exactly a
//! 16-bit signed value, and an array's element type must equal the
//! pointee type. Mismatches name the offending parameter. Transient
//! regions are freed after the call whether it succeeded or not.

use std::fmt;
use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};

use crate::device::{Device, DeviceError};
use crate::load::LoadedFunction;
use crate::sig::{ParamClass, RetKind, Scalar};
use wire::{ARG_AREA_SIZE, CAP_BYTE_ACCESSIBLE, RETURN_SLOT, SLOT_SIZE};

/// A host value for one argument.
#[derive(Debug)]
pub enum Value<'a> {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    F32(f32),
    /// An n-dimensional array for a pointer parameter, or a 0-d array
    /// standing in for a scalar.
    Array(&'a mut ArrayArg),
}

impl Value<'_> {
    /// The scalar type this value carries, `None` for non-0-d arrays.
    fn scalar(&self) -> Option<Scalar> {
        match self {
            Value::I8(_) => Some(Scalar::I8),
            Value::U8(_) => Some(Scalar::U8),
            Value::I16(_) => Some(Scalar::I16),
            Value::U16(_) => Some(Scalar::U16),
            Value::I32(_) => Some(Scalar::I32),
            Value::U32(_) => Some(Scalar::U32),
            Value::F32(_) => Some(Scalar::F32),
            Value::Array(a) if a.is_scalar() => Some(a.dtype),
            Value::Array(_) => None,
        }
    }
}

/// A typed, shaped, contiguous array in host memory. Flattened storage is
/// little-endian, matching the device, so transfers are straight copies.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayArg {
    dtype: Scalar,
    shape: Vec<usize>,
    data: Vec<u8>,
}

macro_rules! array_ctors {
    ($from:ident, $scalar:ident, $elem:ty, $to:ident) => {
        pub fn $from(values: &[$elem]) -> Self {
            let mut data = Vec::with_capacity(values.len() * std::mem::size_of::<$elem>());
            for v in values {
                data.extend_from_slice(&v.to_le_bytes());
            }
            Self {
                dtype: Scalar::$scalar,
                shape: vec![values.len()],
                data,
            }
        }

        /// Reads the (possibly synced-back) contents as host values.
        /// Panics if the array's dtype differs.
        pub fn $to(&self) -> Vec<$elem> {
            assert_eq!(
                self.dtype,
                Scalar::$scalar,
                "array holds {:?}, not {}",
                self.dtype,
                stringify!($elem),
            );
            self.data
                .chunks_exact(std::mem::size_of::<$elem>())
                .map(|c| <$elem>::from_le_bytes(c.try_into().unwrap()))
                .collect()
        }
    };
}

impl ArrayArg {
    array_ctors!(from_i8, I8, i8, to_i8);
    array_ctors!(from_u8, U8, u8, to_u8);
    array_ctors!(from_i16, I16, i16, to_i16);
    array_ctors!(from_u16, U16, u16, to_u16);
    array_ctors!(from_i32, I32, i32, to_i32);
    array_ctors!(from_u32, U32, u32, to_u32);
    array_ctors!(from_f32, F32, f32, to_f32);

    /// A 0-d array: a scalar dressed as an array, accepted by value
    /// parameters.
    pub fn scalar_f32(v: f32) -> Self {
        let mut a = Self::from_f32(&[v]);
        a.shape = Vec::new();
        a
    }

    pub fn scalar_i32(v: i32) -> Self {
        let mut a = Self::from_i32(&[v]);
        a.shape = Vec::new();
        a
    }

    /// Reinterprets the flat data as `shape`. Element count must match.
    pub fn reshaped(mut self, shape: &[usize]) -> Self {
        let count: usize = shape.iter().product();
        assert_eq!(
            count * self.dtype.size(),
            self.data.len(),
            "shape {shape:?} does not cover {} bytes",
            self.data.len(),
        );
        self.shape = shape.to_vec();
        self
    }

    pub fn dtype(&self) -> Scalar {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    /// The single element of a 0-d array, widened into a slot.
    fn scalar_slot(&self) -> [u8; SLOT_SIZE] {
        debug_assert!(self.is_scalar());
        match self.dtype {
            Scalar::I8 => encode_slot_i32(self.data[0] as i8 as i32),
            Scalar::U8 => encode_slot_u32(self.data[0] as u32),
            Scalar::I16 => {
                encode_slot_i32(LittleEndian::read_i16(&self.data) as i32)
            }
            Scalar::U16 => {
                encode_slot_u32(LittleEndian::read_u16(&self.data) as u32)
            }
            Scalar::I32 => encode_slot_i32(LittleEndian::read_i32(&self.data)),
            Scalar::U32 | Scalar::F32 => {
                encode_slot_u32(LittleEndian::read_u32(&self.data))
            }
        }
    }
}

/// The converted return value, per the declared return type.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RetValue {
    Void,
    Pointer(u32),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    F32(f32),
}

#[derive(Debug)]
pub enum CallError {
    /// The handle was freed.
    Invalid,
    CountMismatch { expected: usize, got: usize },
    /// A pointer parameter needs an array value.
    ExpectedArray { index: usize },
    /// A value parameter got a non-0-d array.
    ExpectedScalar { index: usize },
    /// A value parameter got the wrong scalar type; no implicit widening
    /// or conversion.
    TypeMismatch { index: usize, expected: Scalar, got: Scalar },
    /// An array's element type differs from the declared pointee.
    DtypeMismatch { index: usize, expected: Scalar, got: Scalar },
    /// Pointer parameter whose pointee isn't a marshallable scalar.
    OpaquePointer { index: usize },
    Device(DeviceError),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Invalid => write!(f, "function handle has been freed"),
            CallError::CountMismatch { expected, got } => write!(
                f,
                "signature takes {expected} arguments, got {got}"
            ),
            CallError::ExpectedArray { index } => write!(
                f,
                "argument {index}: pointer parameter requires an array"
            ),
            CallError::ExpectedScalar { index } => write!(
                f,
                "argument {index}: value parameter requires a scalar"
            ),
            CallError::TypeMismatch { index, expected, got } => write!(
                f,
                "argument {index}: expected {expected:?}, got {got:?}"
            ),
            CallError::DtypeMismatch { index, expected, got } => write!(
                f,
                "argument {index}: array of {got:?} passed for {expected:?} pointer"
            ),
            CallError::OpaquePointer { index } => write!(
                f,
                "argument {index}: pointee type cannot be marshalled as an array"
            ),
            CallError::Device(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CallError::Device(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DeviceError> for CallError {
    fn from(e: DeviceError) -> Self {
        CallError::Device(e)
    }
}

fn encode_slot_i32(v: i32) -> [u8; SLOT_SIZE] {
    v.to_le_bytes()
}

fn encode_slot_u32(v: u32) -> [u8; SLOT_SIZE] {
    v.to_le_bytes()
}

/// Calls a loaded function with `args`. The argument frame is written,
/// the shim executed, tracked arrays synced back, and the return slot
/// converted; transient array regions are freed even when any step fails.
pub fn call<T: Read + Write>(
    device: &mut Device<T>,
    func: &LoadedFunction,
    args: &mut [Value<'_>],
) -> Result<RetValue, CallError> {
    if !func.is_valid() {
        return Err(CallError::Invalid);
    }
    let params = &func.signature().params;
    if args.len() != params.len() {
        return Err(CallError::CountMismatch {
            expected: params.len(),
            got: args.len(),
        });
    }

    let mut transients: Vec<u32> = Vec::new();
    let result = run_call(device, func, args, &mut transients);

    // Cleanup happens regardless of how the call went; a failure to free
    // must not mask the call's own error.
    for address in transients {
        let _ = device.free(address);
    }
    result
}

fn run_call<T: Read + Write>(
    device: &mut Device<T>,
    func: &LoadedFunction,
    args: &mut [Value<'_>],
    transients: &mut Vec<u32>,
) -> Result<RetValue, CallError> {
    let params = &func.signature().params;
    let mut frame = [0u8; ARG_AREA_SIZE];
    // Arrays that need reading back after the call: (arg index, device
    // address).
    let mut tracked: Vec<(usize, u32)> = Vec::new();

    for (index, (param, value)) in
        params.iter().zip(args.iter()).enumerate()
    {
        let slot = match param.class {
            ParamClass::Value => {
                let expected = param
                    .scalar
                    .expect("value parameters always carry a scalar type");
                let got = value.scalar().ok_or(CallError::ExpectedScalar {
                    index,
                })?;
                if got != expected {
                    return Err(CallError::TypeMismatch {
                        index,
                        expected,
                        got,
                    });
                }
                encode_scalar(value)
            }
            ParamClass::Pointer => {
                let Value::Array(array) = value else {
                    return Err(CallError::ExpectedArray { index });
                };
                let expected = param
                    .scalar
                    .ok_or(CallError::OpaquePointer { index })?;
                if array.dtype != expected {
                    return Err(CallError::DtypeMismatch {
                        index,
                        expected,
                        got: array.dtype,
                    });
                }

                // Transient device copy of the flattened array; the slot
                // carries its address.
                let address = device.alloc(
                    (array.byte_len() as u32).max(1),
                    SLOT_SIZE as u32,
                    CAP_BYTE_ACCESSIBLE,
                )?;
                transients.push(address);
                device.write(address, &array.data)?;
                if func.sync {
                    tracked.push((index, address));
                }
                encode_slot_u32(address)
            }
        };
        frame[index * SLOT_SIZE..(index + 1) * SLOT_SIZE]
            .copy_from_slice(&slot);
    }

    device.write(func.args_address, &frame)?;
    // The shim's own return value is always zero; the interesting result
    // comes back through the return slot.
    let _ = device.execute(func.entry())?;

    if func.sync {
        for (index, address) in tracked {
            let Value::Array(array) = &mut args[index] else {
                continue;
            };
            let bytes = device.read(address, array.byte_len() as u32)?;
            array.data.copy_from_slice(&bytes);
        }
    }

    let slot_addr = func.args_address + (RETURN_SLOT * SLOT_SIZE) as u32;
    let slot = device.read(slot_addr, SLOT_SIZE as u32)?;
    Ok(convert_return(func.signature().ret, &slot))
}

fn encode_scalar(value: &Value<'_>) -> [u8; SLOT_SIZE] {
    match value {
        Value::I8(v) => encode_slot_i32(*v as i32),
        Value::U8(v) => encode_slot_u32(*v as u32),
        Value::I16(v) => encode_slot_i32(*v as i32),
        Value::U16(v) => encode_slot_u32(*v as u32),
        Value::I32(v) => encode_slot_i32(*v),
        Value::U32(v) => encode_slot_u32(*v),
        Value::F32(v) => encode_slot_u32(v.to_bits()),
        Value::Array(a) => a.scalar_slot(),
    }
}

/// Interprets the return slot per the declared return type: bottom bytes
/// for narrow integers, bit pattern for floats.
fn convert_return(ret: RetKind, slot: &[u8]) -> RetValue {
    match ret {
        RetKind::Void => RetValue::Void,
        RetKind::Pointer => RetValue::Pointer(LittleEndian::read_u32(slot)),
        // The wrapper already truncated the double to a float in the slot.
        RetKind::Double => {
            RetValue::F32(f32::from_bits(LittleEndian::read_u32(slot)))
        }
        RetKind::Scalar(s) => match s {
            Scalar::I8 => RetValue::I8(slot[0] as i8),
            Scalar::U8 => RetValue::U8(slot[0]),
            Scalar::I16 => RetValue::I16(LittleEndian::read_i16(slot)),
            Scalar::U16 => RetValue::U16(LittleEndian::read_u16(slot)),
            Scalar::I32 => RetValue::I32(LittleEndian::read_i32(slot)),
            Scalar::U32 => RetValue::U32(LittleEndian::read_u32(slot)),
            Scalar::F32 => {
                RetValue::F32(f32::from_bits(LittleEndian::read_u32(slot)))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arrays_flatten_little_endian() {
        let a = ArrayArg::from_i16(&[0x0102, -2]);
        assert_eq!(a.byte_len(), 4);
        assert_eq!(a.shape(), &[2]);
        assert_eq!(a.to_i16(), vec![0x0102, -2]);

        let f = ArrayArg::from_f32(&[1.0]);
        assert_eq!(f.byte_len(), 4);
        assert_eq!(f.to_f32(), vec![1.0]);
    }

    #[test]
    fn reshape_preserves_data() {
        let a = ArrayArg::from_u8(&[1, 2, 3, 4, 5, 6]).reshaped(&[2, 3]);
        assert_eq!(a.shape(), &[2, 3]);
        assert_eq!(a.to_u8(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    #[should_panic]
    fn reshape_rejects_wrong_element_count() {
        let _ = ArrayArg::from_u8(&[1, 2, 3]).reshaped(&[2, 2]);
    }

    #[test]
    fn zero_d_arrays_are_scalars() {
        let s = ArrayArg::scalar_i32(-5);
        assert!(s.is_scalar());
        assert_eq!(s.scalar_slot(), (-5i32).to_le_bytes());

        let f = ArrayArg::scalar_f32(2.5);
        assert_eq!(f.scalar_slot(), 2.5f32.to_bits().to_le_bytes());
    }

    #[test]
    fn scalar_encodings_widen_per_sign() {
        assert_eq!(encode_scalar(&Value::I8(-1)), 0xFFFF_FFFFu32.to_le_bytes());
        assert_eq!(encode_scalar(&Value::U8(0xFF)), 0x0000_00FFu32.to_le_bytes());
        assert_eq!(
            encode_scalar(&Value::I16(-2)),
            0xFFFF_FFFEu32.to_le_bytes()
        );
        assert_eq!(
            encode_scalar(&Value::U16(0xABCD)),
            0x0000_ABCDu32.to_le_bytes()
        );
        assert_eq!(
            encode_scalar(&Value::F32(2.5)),
            2.5f32.to_bits().to_le_bytes()
        );
    }

    #[test]
    fn return_conversion_respects_width_and_sign() {
        let slot = 0xFFFF_FFFEu32.to_le_bytes();
        assert_eq!(
            convert_return(RetKind::Scalar(Scalar::I16), &slot),
            RetValue::I16(-2)
        );
        assert_eq!(
            convert_return(RetKind::Scalar(Scalar::U16), &slot),
            RetValue::U16(0xFFFE)
        );
        assert_eq!(
            convert_return(RetKind::Scalar(Scalar::I32), &slot),
            RetValue::I32(-2)
        );

        let slot = 2.5f32.to_bits().to_le_bytes();
        assert_eq!(
            convert_return(RetKind::Scalar(Scalar::F32), &slot),
            RetValue::F32(2.5)
        );
        assert_eq!(convert_return(RetKind::Double, &slot), RetValue::F32(2.5));
        assert_eq!(convert_return(RetKind::Void, &slot), RetValue::Void);

        let slot = 0x4800_1000u32.to_le_bytes();
        assert_eq!(
            convert_return(RetKind::Pointer, &slot),
            RetValue::Pointer(0x4800_1000)
        );
    }
}
