//! Provides an immutable view over the bytes of a cached value.
use bytes::Bytes;

/// An immutable byte value as stored in and served from a cache namespace.
///
/// Once constructed, the underlying buffer is never mutated again. This allows
/// views to be cloned and handed around freely: a clone only bumps a reference
/// count, it never copies the payload. Consumers which need an owned, mutable
/// buffer use [to_vec](ByteView::to_vec), which copies.
///
/// # Examples
/// ```
/// # use callisto::cache::ByteView;
/// let view = ByteView::from(b"static resource".to_vec());
///
/// assert_eq!(view.len(), 15);
/// assert_eq!(view.as_slice(), b"static resource");
///
/// // Clones share the buffer...
/// let shared = view.clone();
/// assert_eq!(shared.as_slice(), view.as_slice());
///
/// // ...while to_vec yields an independent copy.
/// let mut copy = view.to_vec();
/// copy[0] = b'S';
/// assert_eq!(view.as_slice()[0], b's');
/// ```
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct ByteView {
    data: Bytes,
}

impl ByteView {
    /// Returns the length of the viewed bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Determines if the view is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Provides read access to the viewed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Returns an independent copy of the viewed bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// Returns a cheaply cloneable handle to the underlying (read-only) buffer.
    ///
    /// This is intended for transports which write the value onto the wire without
    /// copying it first.
    pub fn to_bytes(&self) -> Bytes {
        self.data.clone()
    }
}

impl From<Vec<u8>> for ByteView {
    fn from(data: Vec<u8>) -> Self {
        ByteView {
            data: Bytes::from(data),
        }
    }
}

impl From<Bytes> for ByteView {
    fn from(data: Bytes) -> Self {
        ByteView { data }
    }
}

impl AsRef<[u8]> for ByteView {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
