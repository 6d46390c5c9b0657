//! Structured views of the payload as matrices of fixed-size elements.
//!
//! Type codes are compatible with OpenCV (`CV_8UC3` and friends) so a view
//! can be wrapped by an image library on either side without translation.

use serde_derive::{Deserialize, Serialize};

use super::errors::{IpcError, Result};

mod view;

pub use view::{CloseAction, ImageView};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum Depth {
    U8 = 0,
    I8 = 1,
    U16 = 2,
    I16 = 3,
    I32 = 4,
    F32 = 5,
    F64 = 6,
}

impl Depth {
    pub fn from_code(code: i32) -> Option<Depth> {
        Some(match code {
            0 => Depth::U8,
            1 => Depth::I8,
            2 => Depth::U16,
            3 => Depth::I16,
            4 => Depth::I32,
            5 => Depth::F32,
            6 => Depth::F64,
            _ => return None,
        })
    }

    pub fn size(self) -> usize {
        match self {
            Depth::U8 | Depth::I8 => 1,
            Depth::U16 | Depth::I16 => 2,
            Depth::I32 | Depth::F32 => 4,
            Depth::F64 => 8,
        }
    }

    /// Decodes one native-endian scalar. `bytes` is exactly `size()` long.
    fn decode(self, bytes: &[u8]) -> f64 {
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        match self {
            Depth::U8 => bytes[0] as f64,
            Depth::I8 => bytes[0] as i8 as f64,
            Depth::U16 => u16::from_ne_bytes([buf[0], buf[1]]) as f64,
            Depth::I16 => i16::from_ne_bytes([buf[0], buf[1]]) as f64,
            Depth::I32 => i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64,
            Depth::F32 => f32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64,
            Depth::F64 => f64::from_ne_bytes(buf),
        }
    }

    /// Integer depths saturate, like `saturate_cast`.
    fn encode(self, value: f64, out: &mut [u8]) {
        match self {
            Depth::U8 => out[0] = value.round() as u8,
            Depth::I8 => out[0] = (value.round() as i8) as u8,
            Depth::U16 => out.copy_from_slice(&(value.round() as u16).to_ne_bytes()),
            Depth::I16 => out.copy_from_slice(&(value.round() as i16).to_ne_bytes()),
            Depth::I32 => out.copy_from_slice(&(value.round() as i32).to_ne_bytes()),
            Depth::F32 => out.copy_from_slice(&(value as f32).to_ne_bytes()),
            Depth::F64 => out.copy_from_slice(&value.to_ne_bytes()),
        }
    }
}

const CHANNEL_SHIFT: i32 = 3;
const MAX_CHANNELS: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementType {
    pub depth: Depth,
    pub channels: usize,
}

impl ElementType {
    pub const U8C1: ElementType = ElementType::new(Depth::U8, 1);
    pub const U8C3: ElementType = ElementType::new(Depth::U8, 3);
    pub const U8C4: ElementType = ElementType::new(Depth::U8, 4);
    pub const F32C1: ElementType = ElementType::new(Depth::F32, 1);
    pub const F64C1: ElementType = ElementType::new(Depth::F64, 1);

    pub const fn new(depth: Depth, channels: usize) -> ElementType {
        ElementType { depth, channels }
    }

    /// OpenCV style `CV_MAKETYPE(depth, channels)`.
    pub fn type_code(self) -> i32 {
        self.depth as i32 + (((self.channels as i32) - 1) << CHANNEL_SHIFT)
    }

    pub fn from_type_code(code: i32) -> Option<ElementType> {
        if code < 0 {
            return None;
        }
        let depth = Depth::from_code(code & ((1 << CHANNEL_SHIFT) - 1))?;
        let channels = ((code >> CHANNEL_SHIFT) + 1) as usize;
        if channels > MAX_CHANNELS {
            return None;
        }
        Some(ElementType { depth, channels })
    }

    /// Bytes per element, all channels included; `None` on overflow.
    pub fn size(self) -> Option<usize> {
        self.depth.size().checked_mul(self.channels)
    }
}

/// Extent of a view in elements. The first dimension is rows, the product
/// of the rest is columns.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageShape {
    sizes: Vec<usize>,
}

impl ImageShape {
    pub fn new(sizes: &[usize]) -> ImageShape {
        ImageShape {
            sizes: sizes.to_vec(),
        }
    }

    pub fn matrix(rows: usize, cols: usize) -> ImageShape {
        ImageShape::new(&[rows, cols])
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn dims(&self) -> usize {
        self.sizes.len()
    }

    pub fn rows(&self) -> usize {
        self.sizes.first().copied().unwrap_or(0)
    }

    pub fn cols(&self) -> usize {
        match self.sizes.len() {
            0 => 0,
            1 => 1,
            _ => self.sizes[1..].iter().product(),
        }
    }

    /// Number of elements; `None` on overflow.
    pub fn total(&self) -> Option<usize> {
        if self.sizes.is_empty() {
            return Some(0);
        }
        self.sizes.iter().try_fold(1usize, |acc, &s| acc.checked_mul(s))
    }

    /// Bytes covered by the shape; `None` on overflow.
    pub fn byte_len(&self, elem: ElementType) -> Option<usize> {
        self.total()?.checked_mul(elem.size()?)
    }

    /// Byte offset of one scalar, checked against the shape.
    pub(crate) fn scalar_offset(
        &self,
        elem: ElementType,
        row: usize,
        col: usize,
        channel: usize,
    ) -> Result<usize> {
        let (rows, cols) = (self.rows(), self.cols());
        let elem_size = elem.size().unwrap_or(usize::MAX);
        if row >= rows || col >= cols || channel >= elem.channels || self.byte_len(elem).is_none() {
            let element = row.saturating_mul(cols).saturating_add(col);
            return Err(IpcError::Bounds {
                offset: element.saturating_mul(elem_size),
                length: elem.depth.size(),
                size: self.byte_len(elem).unwrap_or(usize::MAX),
            });
        }
        Ok((row * cols + col) * elem_size + channel * elem.depth.size())
    }
}

pub(crate) fn read_scalar(
    data: &[u8],
    shape: &ImageShape,
    elem: ElementType,
    row: usize,
    col: usize,
    channel: usize,
) -> Result<f64> {
    let at = shape.scalar_offset(elem, row, col, channel)?;
    Ok(elem.depth.decode(&data[at..at + elem.depth.size()]))
}

pub(crate) fn write_scalar(
    data: &mut [u8],
    shape: &ImageShape,
    elem: ElementType,
    row: usize,
    col: usize,
    channel: usize,
    value: f64,
) -> Result<()> {
    let at = shape.scalar_offset(elem, row, col, channel)?;
    elem.depth.encode(value, &mut data[at..at + elem.depth.size()]);
    Ok(())
}

/// Owned image data, only ever produced by an explicit copy.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    shape: ImageShape,
    elem: ElementType,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(shape: ImageShape, elem: ElementType, data: Vec<u8>) -> Result<Frame> {
        let expected = shape.byte_len(elem).unwrap_or(usize::MAX);
        if data.len() != expected {
            return Err(IpcError::Bounds {
                offset: 0,
                length: data.len(),
                size: expected,
            });
        }
        Ok(Frame { shape, elem, data })
    }

    pub fn zeroed(shape: ImageShape, elem: ElementType) -> Result<Frame> {
        let len = shape.byte_len(elem).ok_or(IpcError::Bounds {
            offset: 0,
            length: usize::MAX,
            size: isize::MAX as usize,
        })?;
        Ok(Frame {
            shape,
            elem,
            data: vec![0; len],
        })
    }

    pub fn shape(&self) -> &ImageShape {
        &self.shape
    }

    pub fn element_type(&self) -> ElementType {
        self.elem
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn get_f64(&self, row: usize, col: usize, channel: usize) -> Result<f64> {
        read_scalar(&self.data, &self.shape, self.elem, row, col, channel)
    }

    pub fn put_f64(&mut self, row: usize, col: usize, channel: usize, value: f64) -> Result<()> {
        write_scalar(&mut self.data, &self.shape, self.elem, row, col, channel, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes_match_opencv() {
        // CV_8UC1 = 0, CV_8UC3 = 16, CV_32FC1 = 5, CV_64FC3 = 22
        assert_eq!(ElementType::U8C1.type_code(), 0);
        assert_eq!(ElementType::U8C3.type_code(), 16);
        assert_eq!(ElementType::F32C1.type_code(), 5);
        assert_eq!(ElementType::new(Depth::F64, 3).type_code(), 22);
        assert_eq!(ElementType::from_type_code(16), Some(ElementType::U8C3));
        assert_eq!(ElementType::from_type_code(7), None);
        assert_eq!(ElementType::from_type_code(-1), None);
    }

    #[test]
    fn shape_sizes() {
        let shape = ImageShape::new(&[4, 3, 2]);
        assert_eq!(shape.rows(), 4);
        assert_eq!(shape.cols(), 6);
        assert_eq!(shape.total(), Some(24));
        assert_eq!(shape.byte_len(ElementType::new(Depth::I16, 2)), Some(96));
        assert_eq!(ImageShape::new(&[]).byte_len(ElementType::U8C1), Some(0));
        assert_eq!(ImageShape::matrix(usize::MAX, 2).total(), None);
    }

    #[test]
    fn frame_scalar_access() {
        let mut frame = Frame::zeroed(ImageShape::matrix(2, 3), ElementType::U8C3).unwrap();
        assert_eq!(frame.len(), 18);
        frame.put_f64(1, 2, 2, 200.0).unwrap();
        frame.put_f64(0, 0, 0, 300.0).unwrap();
        assert_eq!(frame.get_f64(1, 2, 2).unwrap(), 200.0);
        assert_eq!(frame.as_bytes()[17], 200);
        assert_eq!(frame.get_f64(0, 0, 0).unwrap(), 255.0);
        assert!(frame.get_f64(2, 0, 0).is_err());
        assert!(frame.put_f64(0, 0, 3, 1.0).is_err());
    }

    #[test]
    fn float_and_signed_depths() {
        let mut frame = Frame::zeroed(ImageShape::matrix(1, 2), ElementType::new(Depth::I16, 1)).unwrap();
        frame.put_f64(0, 1, 0, -1234.0).unwrap();
        assert_eq!(frame.get_f64(0, 1, 0).unwrap(), -1234.0);

        let mut frame = Frame::zeroed(ImageShape::matrix(1, 1), ElementType::F64C1).unwrap();
        frame.put_f64(0, 0, 0, 0.125).unwrap();
        assert_eq!(frame.get_f64(0, 0, 0).unwrap(), 0.125);
    }

    #[test]
    fn huge_channel_counts_do_not_overflow() {
        let elem = ElementType::new(Depth::F64, usize::MAX);
        assert_eq!(elem.size(), None);
        assert_eq!(ElementType::U8C3.size(), Some(3));
        assert_eq!(ImageShape::matrix(1, 1).byte_len(elem), None);
        assert!(Frame::zeroed(ImageShape::matrix(1, 1), elem).is_err());
        assert!(read_scalar(&[0u8; 8], &ImageShape::matrix(1, 1), elem, 0, 0, 0).is_err());
    }

    #[test]
    fn frame_length_must_match_shape() {
        assert!(Frame::new(ImageShape::matrix(2, 2), ElementType::U8C1, vec![0; 3]).is_err());
        assert!(Frame::new(ImageShape::matrix(2, 2), ElementType::U8C1, vec![0; 4]).is_ok());
    }
}
