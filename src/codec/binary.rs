//! Decoders for the fixed binary layouts returned by validator state queries.
//!
//! Every decoder is a pure function of its input slice. Reads split the remaining input with an
//! explicit length check, so a short buffer always surfaces as [`ErrorKind::TruncatedBuffer`]
//! rather than a panic or a partially filled value.
//!
//! [`ErrorKind::TruncatedBuffer`]: crate::error::ErrorKind::TruncatedBuffer

use alloy_primitives::{I256, U256};

use super::address::{RAW_ADDRESS_LEN, RawAddress};
use crate::{
    Error, Result,
    error::ensure,
    types::validator::{CommissionInfo, ValidatorMetadata, ValidatorState},
};

/// Fixed-point scale of on-chain decimals.
const DECIMAL_SCALE: f64 = 1e12;

const I256_LEN: usize = 32;

/// Offset of the commission rate within a commission response.
const RATE_OFFSET: usize = 1;

/// Offset of the maximum commission change within a commission response.
const MAX_CHANGE_OFFSET: usize = RATE_OFFSET + I256_LEN;

/// Minimum length of a commission response.
pub const COMMISSION_LEN: usize = MAX_CHANGE_OFFSET + I256_LEN;

fn take<'a>(buf: &'a [u8], len: usize, field: &str) -> Result<(&'a [u8], &'a [u8])> {
    buf.split_at_checked(len).ok_or_else(|| {
        Error::truncated_buffer().context(format!(
            "{field}: need {len} bytes, {} remaining",
            buf.len()
        ))
    })
}

fn read_u8<'a>(buf: &'a [u8], field: &str) -> Result<(u8, &'a [u8])> {
    let (byte, rest) = take(buf, 1, field)?;
    Ok((byte[0], rest))
}

/// A one-byte present/absent discriminant.
fn read_option_tag<'a>(buf: &'a [u8], field: &str) -> Result<(bool, &'a [u8])> {
    match read_u8(buf, field)? {
        (0, rest) => Ok((false, rest)),
        (1, rest) => Ok((true, rest)),
        (tag, _) => Err(Error::unknown_variant(tag).context(format!("{field}: option tag"))),
    }
}

/// A UTF-8 string preceded by its length as a 4-byte little-endian integer.
fn read_string<'a>(buf: &'a [u8], field: &str) -> Result<(String, &'a [u8])> {
    let (len, rest) = take(buf, 4, field)?;
    let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]);
    let (bytes, rest) = take(rest, len as usize, field)?;
    let s = std::str::from_utf8(bytes).map_err(|err| {
        Error::invalid_encoding().context(format!("{field}: {err}"))
    })?;
    Ok((s.to_string(), rest))
}

fn read_optional_string<'a>(buf: &'a [u8], field: &str) -> Result<(Option<String>, &'a [u8])> {
    match read_option_tag(buf, field)? {
        (false, rest) => Ok((None, rest)),
        (true, rest) => {
            let (s, rest) = read_string(rest, field)?;
            Ok((Some(s), rest))
        }
    }
}

/// A 32-byte little-endian two's-complement integer.
fn read_i256<'a>(buf: &'a [u8], field: &str) -> Result<(I256, &'a [u8])> {
    let (bytes, rest) = buf.split_first_chunk::<I256_LEN>().ok_or_else(|| {
        Error::truncated_buffer().context(format!(
            "{field}: need {I256_LEN} bytes, {} remaining",
            buf.len()
        ))
    })?;
    Ok((I256::from_raw(U256::from_le_bytes(*bytes)), rest))
}

/// Scale a fixed-point on-chain integer down to a decimal.
fn to_decimal(value: I256) -> f64 {
    let (sign, abs) = value.into_sign_and_abs();
    let magnitude = abs
        .as_limbs()
        .iter()
        .rev()
        .fold(0.0, |acc, &limb| acc * 2f64.powi(64) + limb as f64);
    let value = magnitude / DECIMAL_SCALE;
    if sign.is_negative() { -value } else { value }
}

/// Decode a validator metadata record.
///
/// Bytes following the last field are ignored.
pub fn decode_metadata(buf: &[u8]) -> Result<ValidatorMetadata> {
    let (email, rest) = read_string(buf, "email")?;
    let (description, rest) = read_optional_string(rest, "description")?;
    let (website, rest) = read_optional_string(rest, "website")?;
    let (discord_handle, rest) = read_optional_string(rest, "discord_handle")?;
    let (avatar, _) = read_optional_string(rest, "avatar")?;
    Ok(ValidatorMetadata {
        email,
        description,
        website,
        discord_handle,
        avatar,
    })
}

/// Decode the response to a metadata query: an option tag followed by the metadata record.
///
/// A validator which never published metadata answers with an absent option, which is reported
/// as a [`ProtocolError`](crate::error::ErrorKind::ProtocolError).
pub fn decode_metadata_response(buf: &[u8]) -> Result<ValidatorMetadata> {
    match read_option_tag(buf, "metadata")? {
        (true, rest) => decode_metadata(rest),
        (false, _) => Err(Error::protocol().context("validator has no metadata")),
    }
}

/// Decode the response to a commission query.
///
/// The rate and the maximum change per epoch occupy `buf[1..33]` and `buf[33..65]`.
pub fn decode_commission(buf: &[u8]) -> Result<CommissionInfo> {
    ensure!(
        buf.len() >= COMMISSION_LEN,
        Error::truncated_buffer().context(format!(
            "commission: need {COMMISSION_LEN} bytes, have {}",
            buf.len()
        ))
    );
    let (_, rest) = take(buf, RATE_OFFSET, "commission tag")?;
    let (rate, rest) = read_i256(rest, "commission rate")?;
    let (max_change_per_epoch, _) = read_i256(rest, "max commission change")?;
    Ok(CommissionInfo {
        rate: to_decimal(rate),
        max_change_per_epoch: to_decimal(max_change_per_epoch),
    })
}

/// Decode the response to a state query: the state ordinal follows a one-byte tag.
pub fn decode_state(buf: &[u8]) -> Result<ValidatorState> {
    let (_, rest) = take(buf, 1, "state tag")?;
    let (ordinal, _) = read_u8(rest, "state")?;
    ValidatorState::from_ordinal(ordinal)
        .ok_or_else(|| Error::unknown_variant(ordinal).context("validator state"))
}

/// Decode the response to a reverse lookup from node address to account address.
///
/// The address is returned in registry-lookup form, as stored on chain.
pub fn decode_address(buf: &[u8]) -> Result<RawAddress> {
    let (present, rest) = read_option_tag(buf, "address")?;
    ensure!(
        present,
        Error::protocol().context("no validator registered for node address")
    );
    let (bytes, _) = take(rest, RAW_ADDRESS_LEN, "address")?;
    RawAddress::try_from(bytes)
}

/// Encoders producing the same layouts, for building node responses in tests.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;

    fn put_string(out: &mut Vec<u8>, s: &str) {
        out.extend_from_slice(&(s.len() as u32).to_le_bytes());
        out.extend_from_slice(s.as_bytes());
    }

    fn put_optional_string(out: &mut Vec<u8>, s: &Option<String>) {
        match s {
            Some(s) => {
                out.push(1);
                put_string(out, s);
            }
            None => out.push(0),
        }
    }

    fn put_decimal(out: &mut Vec<u8>, value: f64) {
        let scaled = (value * DECIMAL_SCALE).round() as i128;
        out.extend_from_slice(&scaled.to_le_bytes());
        let extension = if scaled < 0 { 0xff } else { 0 };
        out.extend_from_slice(&[extension; I256_LEN - 16]);
    }

    pub fn encode_metadata(metadata: &ValidatorMetadata) -> Vec<u8> {
        let mut out = vec![];
        put_string(&mut out, &metadata.email);
        put_optional_string(&mut out, &metadata.description);
        put_optional_string(&mut out, &metadata.website);
        put_optional_string(&mut out, &metadata.discord_handle);
        put_optional_string(&mut out, &metadata.avatar);
        out
    }

    pub fn metadata_response(metadata: &ValidatorMetadata) -> Vec<u8> {
        let mut out = vec![1];
        out.extend(encode_metadata(metadata));
        out
    }

    pub fn commission_response(commission: &CommissionInfo) -> Vec<u8> {
        let mut out = vec![1];
        put_decimal(&mut out, commission.rate);
        put_decimal(&mut out, commission.max_change_per_epoch);
        out
    }

    pub fn state_response(state: ValidatorState) -> Vec<u8> {
        vec![1, state.ordinal()]
    }

    pub fn address_response(raw: &RawAddress) -> Vec<u8> {
        let mut out = vec![1];
        out.extend_from_slice(&raw.to_bytes());
        out
    }
}

#[cfg(test)]
mod test {
    use super::{testing::*, *};
    use crate::error::ErrorKind;

    fn full_metadata() -> ValidatorMetadata {
        ValidatorMetadata {
            email: "ops@validator.example".into(),
            description: Some("Run from a basement ✨".into()),
            website: None,
            discord_handle: Some("ops#0001".into()),
            avatar: Some("https://validator.example/a.png".into()),
        }
    }

    #[test]
    fn test_metadata() {
        let metadata = full_metadata();
        let buf = encode_metadata(&metadata);
        assert_eq!(decode_metadata(&buf).unwrap(), metadata);

        let mut trailing = buf.clone();
        trailing.extend_from_slice(&[9, 9, 9]);
        assert_eq!(decode_metadata(&trailing).unwrap(), metadata);

        assert_eq!(
            decode_metadata_response(&metadata_response(&metadata)).unwrap(),
            metadata
        );
        let err = decode_metadata_response(&[0]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }

    #[test]
    fn test_metadata_truncation() {
        let buf = encode_metadata(&full_metadata());
        for len in 0..buf.len() {
            let err = decode_metadata(&buf[..len]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TruncatedBuffer, "prefix of {len} bytes");
        }
    }

    #[test]
    fn test_metadata_bad_bytes() {
        let mut buf = vec![];
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&[0xc3, 0x28]);
        let err = decode_metadata(&buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEncoding);

        let mut buf = encode_metadata(&ValidatorMetadata::default());
        buf[4] = 2;
        let err = decode_metadata(&buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownVariant(2));

        let mut huge = u32::MAX.to_le_bytes().to_vec();
        huge.extend_from_slice(b"short");
        let err = decode_metadata(&huge).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TruncatedBuffer);
    }

    #[test]
    fn test_commission() {
        let zero = decode_commission(&[0; COMMISSION_LEN]).unwrap();
        assert_eq!(zero.rate, 0.0);
        assert_eq!(zero.max_change_per_epoch, 0.0);

        let mut buf = vec![1];
        buf.extend_from_slice(&(-1_000_000_000_000i128).to_le_bytes());
        buf.extend_from_slice(&[0xff; 16]);
        buf.extend_from_slice(&[0; I256_LEN]);
        let negative = decode_commission(&buf).unwrap();
        assert_eq!(negative.rate, -1.0);
        assert_eq!(negative.max_change_per_epoch, 0.0);

        let commission = CommissionInfo {
            rate: 0.05,
            max_change_per_epoch: 0.01,
        };
        assert_eq!(
            decode_commission(&commission_response(&commission)).unwrap(),
            commission
        );

        let err = decode_commission(&[0; COMMISSION_LEN - 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TruncatedBuffer);
    }

    #[test]
    fn test_state() {
        assert_eq!(decode_state(&[1, 0]).unwrap(), ValidatorState::Consensus);
        assert_eq!(decode_state(&[1, 4]).unwrap(), ValidatorState::Jailed);
        assert_eq!(
            decode_state(&[1, 5]).unwrap_err().kind(),
            ErrorKind::UnknownVariant(5)
        );
        assert_eq!(
            decode_state(&[1]).unwrap_err().kind(),
            ErrorKind::TruncatedBuffer
        );
    }

    #[test]
    fn test_address() {
        let raw = RawAddress::new(0, [0x42; 20]);
        assert_eq!(decode_address(&address_response(&raw)).unwrap(), raw);

        let short = &address_response(&raw)[..RAW_ADDRESS_LEN];
        assert_eq!(
            decode_address(short).unwrap_err().kind(),
            ErrorKind::TruncatedBuffer
        );
        assert_eq!(
            decode_address(&[0]).unwrap_err().kind(),
            ErrorKind::ProtocolError
        );
    }
}
