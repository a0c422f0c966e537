use bytes::{Buf, BufMut};

use crate::core::SpillError;

const NULL_TAG: u8 = 0;
const VALUE_TAG: u8 = 1;

/// An element type with a constant encoded width. Columns store these
/// back-to-back inside a batch, so the byte position of any element can be
/// computed from its index alone.
pub trait FixedWidth: Copy + Send + Sync + 'static {
    const WIDTH: usize;

    fn put<B: BufMut>(&self, buf: &mut B);

    /// Caller guarantees `buf.remaining() >= Self::WIDTH`.
    fn get<B: Buf>(buf: &mut B) -> Result<Self, SpillError>;
}

macro_rules! impl_fixed_width {
    ($ty:ty, $put:ident, $get:ident) => {
        impl FixedWidth for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();

            fn put<B: BufMut>(&self, buf: &mut B) {
                buf.$put(*self);
            }

            fn get<B: Buf>(buf: &mut B) -> Result<Self, SpillError> {
                Ok(buf.$get())
            }
        }
    };
}

impl_fixed_width!(i32, put_i32_le, get_i32_le);
impl_fixed_width!(i64, put_i64_le, get_i64_le);
impl_fixed_width!(u32, put_u32_le, get_u32_le);
impl_fixed_width!(u64, put_u64_le, get_u64_le);
impl_fixed_width!(f32, put_f32_le, get_f32_le);
impl_fixed_width!(f64, put_f64_le, get_f64_le);

/// Nullable slot: a tag byte followed by the value, zero-filled when null.
impl<T: FixedWidth> FixedWidth for Option<T> {
    const WIDTH: usize = 1 + T::WIDTH;

    fn put<B: BufMut>(&self, buf: &mut B) {
        match self {
            Some(v) => {
                buf.put_u8(VALUE_TAG);
                v.put(buf);
            }
            None => {
                buf.put_u8(NULL_TAG);
                buf.put_bytes(0, T::WIDTH);
            }
        }
    }

    fn get<B: Buf>(buf: &mut B) -> Result<Self, SpillError> {
        match buf.get_u8() {
            NULL_TAG => {
                buf.advance(T::WIDTH);
                Ok(None)
            }
            VALUE_TAG => Ok(Some(T::get(buf)?)),
            tag => Err(SpillError::CodecError(format!(
                "unknown null tag {tag} in fixed-width slot"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widths() {
        assert_eq!(<i32 as FixedWidth>::WIDTH, 4);
        assert_eq!(<f64 as FixedWidth>::WIDTH, 8);
        assert_eq!(<Option<i32> as FixedWidth>::WIDTH, 5);
    }

    #[test]
    fn test_little_endian_layout() {
        let mut buf = Vec::new();
        0x0102_0304i32.put(&mut buf);
        assert_eq!(buf, vec![0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_nullable_slots_keep_width() {
        let mut buf = Vec::new();
        Some(7i32).put(&mut buf);
        None::<i32>.put(&mut buf);
        assert_eq!(buf.len(), 2 * <Option<i32> as FixedWidth>::WIDTH);

        let mut slice = &buf[..];
        assert_eq!(Option::<i32>::get(&mut slice).unwrap(), Some(7));
        assert_eq!(Option::<i32>::get(&mut slice).unwrap(), None);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_bad_null_tag() {
        let buf = [9u8, 0, 0, 0, 0];
        let err = Option::<i32>::get(&mut &buf[..]).unwrap_err();
        assert!(err.to_string().contains("unknown null tag 9"));
    }
}
