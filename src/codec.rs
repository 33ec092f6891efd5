// ===============================
// src/codec.rs
// ===============================
//
// Wire-level codec for the two binary frame formats exchanged over the
// broker. Two numeric encodings, both packed into little-endian u64:
//
// - change value:    1 sign bit + 63 fraction bits, for values in [-1, 1)
// - orderbook value: 1 sign bit + 10 whole bits + 53 fraction bits,
//                    for values in [-1024, 1024)
//
// Both are exact on zero (anything below ZERO_THRESHOLD encodes as 0)
// and symmetric around zero.

use thiserror::Error;

pub const ZERO_THRESHOLD: f64 = 1e-15;

const CHANGE_SIGN_MASK: u64 = 1 << 63;
const CHANGE_FRAC_MASK: u64 = (1 << 63) - 1;
const CHANGE_FRAC_SCALE: f64 = ((1u64 << 63) - 1) as f64;

const OB_SIGN_MASK: u64 = 1 << 63;
const OB_WHOLE_MASK: u64 = ((1 << 10) - 1) << 53;
const OB_FRAC_MASK: u64 = (1 << 53) - 1;
const OB_FRAC_SCALE: f64 = ((1u64 << 53) - 1) as f64;

const ACTION_KIND_MASK: u8 = 0x07;

pub const LEVELS_PER_SIDE: usize = 400;
pub const VALUES_PER_LEVEL: usize = 3; // price, volume, order count
pub const DEPTH_CUTOFFS: [usize; 5] = [10, 20, 50, 100, 400];
pub const NUM_DEPTHS: usize = 5;
pub const NUM_FEATURES: usize = 4; // VI, OI, bid VWAP disp, ask VWAP disp

/// Feature-frame payload size: both sides, mid change, depth features,
/// absolute mid in cents (u32) and the sequence id (u16).
pub const FEATURE_FRAME_SIZE: usize =
    (LEVELS_PER_SIDE * VALUES_PER_LEVEL * 2 + 1 + NUM_DEPTHS * NUM_FEATURES) * 8 + 4 + 2;

/// Action-frame payload size: kind, price offset, volume fraction,
/// mid in cents, state id.
pub const ACTION_FRAME_SIZE: usize = 23;

pub const MAX_MID_PRICE: f64 = 1_000_000.0;
pub const CENTS_MULTIPLIER: f64 = 100.0;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("mid price {0} outside [0, {MAX_MID_PRICE}]")]
    MidPriceOutOfRange(f64),
    #[error("frame length {got}, expected {expected}")]
    BadLength { got: usize, expected: usize },
}

#[inline]
fn is_zero(value: f64) -> bool {
    value.abs() < ZERO_THRESHOLD
}

/// Encode a change value (prices, displacements, imbalances; range [-1, 1)).
#[inline]
pub fn encode_change_value(value: f64) -> u64 {
    if is_zero(value) {
        return 0;
    }
    let sign = if value < 0.0 { CHANGE_SIGN_MASK } else { 0 };
    let fraction = (value.abs() * CHANGE_FRAC_SCALE) as u64;
    sign | (fraction & CHANGE_FRAC_MASK)
}

#[inline]
pub fn decode_change_value(encoded: u64) -> f64 {
    if encoded == 0 {
        return 0.0;
    }
    let value = (encoded & CHANGE_FRAC_MASK) as f64 / CHANGE_FRAC_SCALE;
    if encoded & CHANGE_SIGN_MASK != 0 {
        -value
    } else {
        value
    }
}

/// Encode an orderbook value (volumes, order counts; range [-1024, 1024)).
/// The whole part saturates at 1023.
#[inline]
pub fn encode_orderbook_value(value: f64) -> u64 {
    if is_zero(value) {
        return 0;
    }
    let sign = if value < 0.0 { OB_SIGN_MASK } else { 0 };
    let abs = value.abs();
    let whole = abs.trunc().min(1023.0) as u64;
    let fraction = (abs.fract() * OB_FRAC_SCALE) as u64;
    sign | ((whole << 53) & OB_WHOLE_MASK) | (fraction & OB_FRAC_MASK)
}

#[inline]
pub fn decode_orderbook_value(encoded: u64) -> f64 {
    if encoded == 0 {
        return 0.0;
    }
    let whole = ((encoded & OB_WHOLE_MASK) >> 53) as f64;
    let fraction = (encoded & OB_FRAC_MASK) as f64 / OB_FRAC_SCALE;
    let value = whole + fraction;
    if encoded & OB_SIGN_MASK != 0 {
        -value
    } else {
        value
    }
}

/// A decoded feature frame: the unit buffered by the decision relay.
///
/// Level data is stored flat, three values per level, bids then asks in
/// book order. `mid_price` is the trustworthy absolute mid recovered from
/// the cent field; `mid_change` is the lossy change-encoded copy carried
/// in the feature block for wire parity.
#[derive(Debug, Clone)]
pub struct BookState {
    pub bids: Vec<f64>,
    pub asks: Vec<f64>,
    pub mid_change: f64,
    pub features: [f64; NUM_DEPTHS * NUM_FEATURES],
    pub mid_price: f64,
    pub state_id: u16,
}

pub fn decode_feature_frame(data: &[u8]) -> Result<BookState, CodecError> {
    if data.len() != FEATURE_FRAME_SIZE {
        return Err(CodecError::BadLength {
            got: data.len(),
            expected: FEATURE_FRAME_SIZE,
        });
    }

    let mut offset = 0usize;
    let read_u64 = |data: &[u8], offset: &mut usize| -> u64 {
        let v = u64::from_le_bytes(data[*offset..*offset + 8].try_into().unwrap());
        *offset += 8;
        v
    };

    let mut bids = Vec::with_capacity(LEVELS_PER_SIDE * VALUES_PER_LEVEL);
    for _ in 0..LEVELS_PER_SIDE {
        bids.push(decode_change_value(read_u64(data, &mut offset)));
        bids.push(decode_orderbook_value(read_u64(data, &mut offset)));
        bids.push(decode_orderbook_value(read_u64(data, &mut offset)));
    }

    let mut asks = Vec::with_capacity(LEVELS_PER_SIDE * VALUES_PER_LEVEL);
    for _ in 0..LEVELS_PER_SIDE {
        asks.push(decode_change_value(read_u64(data, &mut offset)));
        asks.push(decode_orderbook_value(read_u64(data, &mut offset)));
        asks.push(decode_orderbook_value(read_u64(data, &mut offset)));
    }

    let mid_change = decode_change_value(read_u64(data, &mut offset));

    let mut features = [0.0f64; NUM_DEPTHS * NUM_FEATURES];
    for f in features.iter_mut() {
        *f = decode_change_value(read_u64(data, &mut offset));
    }

    let mid_cents = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
    offset += 4;
    let state_id = u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap());

    Ok(BookState {
        bids,
        asks,
        mid_change,
        features,
        mid_price: mid_cents as f64 / CENTS_MULTIPLIER,
        state_id,
    })
}

/// An action frame as published by the decision relay.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionFrame {
    /// Low 3 bits only; 0 = limit, anything else = market.
    pub kind: u8,
    pub price_offset: f64,
    pub volume_fraction: f64,
    pub mid_price: f64,
    pub state_id: u16,
}

impl ActionFrame {
    pub fn encode(&self) -> Result<[u8; ACTION_FRAME_SIZE], CodecError> {
        if self.mid_price < 0.0 || self.mid_price > MAX_MID_PRICE {
            return Err(CodecError::MidPriceOutOfRange(self.mid_price));
        }
        let mut buf = [0u8; ACTION_FRAME_SIZE];
        buf[0] = self.kind & ACTION_KIND_MASK;
        buf[1..9].copy_from_slice(&encode_change_value(self.price_offset).to_le_bytes());
        buf[9..17].copy_from_slice(&encode_orderbook_value(self.volume_fraction).to_le_bytes());
        let mid_cents = (self.mid_price * CENTS_MULTIPLIER).round() as u32;
        buf[17..21].copy_from_slice(&mid_cents.to_le_bytes());
        buf[21..23].copy_from_slice(&self.state_id.to_le_bytes());
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() != ACTION_FRAME_SIZE {
            return Err(CodecError::BadLength {
                got: data.len(),
                expected: ACTION_FRAME_SIZE,
            });
        }
        let kind = data[0] & ACTION_KIND_MASK;
        let price_offset =
            decode_change_value(u64::from_le_bytes(data[1..9].try_into().unwrap()));
        let volume_fraction =
            decode_orderbook_value(u64::from_le_bytes(data[9..17].try_into().unwrap()));
        let mid_cents = u32::from_le_bytes(data[17..21].try_into().unwrap());
        let state_id = u16::from_le_bytes(data[21..23].try_into().unwrap());
        Ok(ActionFrame {
            kind,
            price_offset,
            volume_fraction,
            mid_price: mid_cents as f64 / CENTS_MULTIPLIER,
            state_id,
        })
    }
}
