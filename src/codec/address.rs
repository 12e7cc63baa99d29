//! Bech32m encoding of validator account addresses.

use std::fmt;

use crate::{Error, Result, error::ensure};

/// The 32-symbol bech32 alphabet, indexed by 5-bit value.
const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// Generator coefficients of the BCH checksum polynomial.
const GENERATOR: [u32; 5] = [0x3b6a57b2, 0x26508e6d, 0x1ea119fa, 0x3d4233dd, 0x2a1462b3];

/// The bech32m residue a valid string's checksum polynomial must equal.
const BECH32M_CONST: u32 = 0x2bc830a3;

const SEPARATOR: char = '1';
const CHECKSUM_LEN: usize = 6;
const MAX_LEN: usize = 90;

/// Length of an encoded [`RawAddress`].
pub const RAW_ADDRESS_LEN: usize = 21;

/// Length of the key hash part of a [`RawAddress`].
pub const HASH_LEN: usize = 20;

/// The 21 raw bytes of an on-chain account: a discriminant tag followed by a 20-byte key hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawAddress {
    tag: u8,
    hash: [u8; HASH_LEN],
}

impl RawAddress {
    pub fn new(tag: u8, hash: [u8; HASH_LEN]) -> Self {
        Self { tag, hash }
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn hash(&self) -> &[u8; HASH_LEN] {
        &self.hash
    }

    pub fn to_bytes(&self) -> [u8; RAW_ADDRESS_LEN] {
        let mut bytes = [0; RAW_ADDRESS_LEN];
        bytes[0] = self.tag;
        bytes[1..].copy_from_slice(&self.hash);
        bytes
    }

    /// Toggle the low bit of the tag.
    ///
    /// The registry-lookup form of an address and its display form differ only in this bit.
    pub fn flip_tag(self) -> Self {
        Self {
            tag: self.tag ^ 1,
            hash: self.hash,
        }
    }
}

impl TryFrom<&[u8]> for RawAddress {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let Some((&tag, hash)) = bytes.split_first() else {
            return Err(Error::malformed_address().context("empty address payload"));
        };
        let hash = hash.try_into().map_err(|_| {
            Error::malformed_address().context(format!(
                "address payload has {} bytes, expected {RAW_ADDRESS_LEN}",
                bytes.len()
            ))
        })?;
        Ok(Self { tag, hash })
    }
}

impl fmt::Debug for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RawAddress({:02x}:{})", self.tag, hex::encode(self.hash))
    }
}

fn polymod(values: impl IntoIterator<Item = u8>) -> u32 {
    let mut chk: u32 = 1;
    for value in values {
        let top = chk >> 25;
        chk = ((chk & 0x1ffffff) << 5) ^ u32::from(value);
        for (i, coefficient) in GENERATOR.iter().enumerate() {
            if (top >> i) & 1 == 1 {
                chk ^= coefficient;
            }
        }
    }
    chk
}

/// The checksum-input form of a human-readable prefix.
fn expand_hrp(hrp: &str) -> Vec<u8> {
    let bytes = hrp.as_bytes();
    let mut expanded = Vec::with_capacity(bytes.len() * 2 + 1);
    expanded.extend(bytes.iter().map(|b| b >> 5));
    expanded.push(0);
    expanded.extend(bytes.iter().map(|b| b & 31));
    expanded
}

fn create_checksum(hrp: &str, data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let values = expand_hrp(hrp)
        .into_iter()
        .chain(data.iter().copied())
        .chain([0; CHECKSUM_LEN]);
    let residue = polymod(values) ^ BECH32M_CONST;
    std::array::from_fn(|i| ((residue >> (5 * (CHECKSUM_LEN - 1 - i))) & 31) as u8)
}

fn verify_checksum(hrp: &str, data: &[u8]) -> bool {
    polymod(expand_hrp(hrp).into_iter().chain(data.iter().copied())) == BECH32M_CONST
}

/// Regroup a stream of `from`-bit values into `to`-bit values.
///
/// With `pad`, an incomplete final group is zero-filled. Without it, leftover bits must all be
/// zero and fewer than `from`.
fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Result<Vec<u8>> {
    let max_value: u32 = (1 << to) - 1;
    let max_acc: u32 = (1 << (from + to - 1)) - 1;
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let mut out = Vec::with_capacity(data.len() * from as usize / to as usize + 1);
    for &value in data {
        ensure!(
            u32::from(value) >> from == 0,
            Error::internal().context(format!("value {value} does not fit in {from} bits"))
        );
        acc = ((acc << from) | u32::from(value)) & max_acc;
        bits += from;
        while bits >= to {
            bits -= to;
            out.push(((acc >> bits) & max_value) as u8);
        }
    }
    if pad {
        if bits > 0 {
            out.push(((acc << (to - bits)) & max_value) as u8);
        }
    } else {
        ensure!(
            bits < from && (acc << (to - bits)) & max_value == 0,
            Error::malformed_address().context("non-zero padding in address payload")
        );
    }
    Ok(out)
}

/// Encode a tagged 20-byte key hash as a bech32m string under prefix `hrp`.
pub fn encode(tag: u8, hash: &[u8; HASH_LEN], hrp: &str) -> Result<String> {
    ensure!(
        !hrp.is_empty()
            && hrp
                .bytes()
                .all(|b| (33..=126).contains(&b) && !b.is_ascii_uppercase()),
        Error::malformed_address().context(format!("invalid address prefix {hrp:?}"))
    );

    let payload = RawAddress::new(tag, *hash).to_bytes();
    let data = convert_bits(&payload, 8, 5, true)?;
    let checksum = create_checksum(hrp, &data);

    let mut encoded = String::with_capacity(hrp.len() + 1 + data.len() + CHECKSUM_LEN);
    encoded.push_str(hrp);
    encoded.push(SEPARATOR);
    encoded.extend(
        data.iter()
            .chain(&checksum)
            .map(|&d| char::from(CHARSET[usize::from(d)])),
    );
    Ok(encoded)
}

/// Decode a bech32m string into its human-readable prefix and payload bytes.
///
/// The returned prefix is always lower case.
///
/// A data character outside the bech32 alphabet is [`MalformedAddressString`], checked before
/// the checksum. Only a string made entirely of valid symbols can fail with [`ChecksumMismatch`].
///
/// [`MalformedAddressString`]: crate::error::ErrorKind::MalformedAddressString
/// [`ChecksumMismatch`]: crate::error::ErrorKind::ChecksumMismatch
pub fn decode(s: &str) -> Result<(String, Vec<u8>)> {
    let malformed = |reason: &str| Error::malformed_address().context(format!("{s:?}: {reason}"));

    ensure!(
        s.bytes().all(|b| (33..=126).contains(&b)),
        malformed("character outside printable ASCII")
    );
    ensure!(
        !(s.bytes().any(|b| b.is_ascii_lowercase()) && s.bytes().any(|b| b.is_ascii_uppercase())),
        malformed("mixed case")
    );
    let s = s.to_ascii_lowercase();
    ensure!(s.len() <= MAX_LEN, malformed("too long"));
    let pos = s
        .rfind(SEPARATOR)
        .ok_or_else(|| malformed("missing separator"))?;
    ensure!(
        pos >= 1 && pos + CHECKSUM_LEN + 1 <= s.len(),
        malformed("separator out of place")
    );

    let (hrp, rest) = s.split_at(pos);
    let data = rest[1..]
        .bytes()
        .map(|b| {
            CHARSET
                .iter()
                .position(|&c| c == b)
                .map(|d| d as u8)
                .ok_or_else(|| malformed(&format!("invalid data character {:?}", char::from(b))))
        })
        .collect::<Result<Vec<_>>>()?;
    ensure!(
        verify_checksum(hrp, &data),
        Error::checksum_mismatch().context(format!("{s:?}"))
    );

    let bytes = convert_bits(&data[..data.len() - CHECKSUM_LEN], 5, 8, false)?;
    Ok((hrp.to_string(), bytes))
}

#[cfg(test)]
mod test {
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;
    use crate::error::ErrorKind;

    fn random_address(rng: &mut StdRng) -> RawAddress {
        let mut hash = [0; HASH_LEN];
        rng.fill(&mut hash[..]);
        RawAddress::new(rng.gen_range(0..=u8::MAX), hash)
    }

    #[test]
    fn test_round_trip() {
        let mut rng = StdRng::seed_from_u64(0);
        for hrp in ["tnam", "a", "tnamtest"] {
            for _ in 0..200 {
                let raw = random_address(&mut rng);
                let encoded = encode(raw.tag(), raw.hash(), hrp).unwrap();
                assert_eq!(encoded.len(), hrp.len() + 1 + 34 + CHECKSUM_LEN);
                let (prefix, bytes) = decode(&encoded).unwrap();
                assert_eq!(prefix, hrp);
                assert_eq!(RawAddress::try_from(bytes.as_slice()).unwrap(), raw);
            }
        }
    }

    #[test]
    fn test_upper_case_accepted() {
        let raw = RawAddress::new(0, [0xab; HASH_LEN]);
        let encoded = encode(raw.tag(), raw.hash(), "tnam").unwrap();
        let (prefix, bytes) = decode(&encoded.to_uppercase()).unwrap();
        assert_eq!(prefix, "tnam");
        assert_eq!(bytes, raw.to_bytes());
    }

    #[test]
    fn test_single_substitution() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            let raw = random_address(&mut rng);
            let encoded = encode(raw.tag(), raw.hash(), "tnam").unwrap();
            let pos = rng.gen_range("tnam1".len()..encoded.len());
            let original = encoded.as_bytes()[pos];
            for &replacement in CHARSET.iter().filter(|&&c| c != original) {
                let mut corrupted = encoded.clone().into_bytes();
                corrupted[pos] = replacement;
                let corrupted = String::from_utf8(corrupted).unwrap();
                let err = decode(&corrupted).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::ChecksumMismatch, "{corrupted}");
            }

            // Symbols outside the alphabet are rejected before the checksum is looked at.
            for replacement in [b'b', b'i', b'o', b'1'] {
                let mut corrupted = encoded.clone().into_bytes();
                corrupted[pos] = replacement;
                let corrupted = String::from_utf8(corrupted).unwrap();
                let err = decode(&corrupted).unwrap_err();
                assert!(
                    matches!(
                        err.kind(),
                        ErrorKind::MalformedAddressString | ErrorKind::ChecksumMismatch
                    ),
                    "{corrupted}: {err}"
                );
                // A stray separator moves the prefix boundary instead.
                if replacement != b'1' {
                    assert_eq!(err.kind(), ErrorKind::MalformedAddressString, "{corrupted}");
                }
            }
        }
    }

    #[test]
    fn test_malformed() {
        let encoded = encode(1, &[3; HASH_LEN], "tnam").unwrap();
        let mixed = format!("T{}", &encoded[1..]);
        let too_long = format!("tnam1{}", "q".repeat(MAX_LEN));
        for s in [
            "",
            "tnam",
            "1qqqqqqqq",
            "tnam1qqqqq",
            "tnam 1qqqqqqq",
            "tnam1qqqqqqqb",
            mixed.as_str(),
            too_long.as_str(),
        ] {
            let err = decode(s).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedAddressString, "{s:?}");
        }
    }

    #[test]
    fn test_flip_tag() {
        let raw = RawAddress::new(1, [9; HASH_LEN]);
        assert_eq!(raw.flip_tag().tag(), 0);
        assert_eq!(raw.flip_tag().hash(), raw.hash());
        assert_eq!(raw.flip_tag().flip_tag(), raw);
    }
}
