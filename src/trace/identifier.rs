//! Trace and span identifiers.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rand::{rngs, Rng, SeedableRng};

use crate::error::IdentifierError;

thread_local! {
    /// Store random number generator for each thread
    static CURRENT_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

static EMPTY_HEX: Lazy<Arc<str>> = Lazy::new(|| Arc::from(""));

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum IdBytes {
    Empty,
    Eight([u8; 8]),
    Sixteen([u8; 16]),
}

/// A fixed-length identifier with its hex rendering cached.
///
/// Trace identifiers are 8 or 16 bytes depending on the configured
/// [`IdentifierScheme`]; span identifiers are always 8 bytes. The empty
/// identifier is a first-class sentinel: spans without a parent carry an
/// empty parent id, and [`Identifier::is_empty`] is how call sites test
/// for it.
#[derive(Clone)]
pub struct Identifier {
    bytes: IdBytes,
    hex: Arc<str>,
}

impl Identifier {
    /// The empty identifier.
    pub fn empty() -> Identifier {
        Identifier {
            bytes: IdBytes::Empty,
            hex: EMPTY_HEX.clone(),
        }
    }

    /// Builds an 8-byte identifier.
    pub fn from_bytes_8(bytes: [u8; 8]) -> Identifier {
        Identifier {
            bytes: IdBytes::Eight(bytes),
            hex: Arc::from(hex_of(&bytes)),
        }
    }

    /// Builds a 16-byte identifier.
    pub fn from_bytes_16(bytes: [u8; 16]) -> Identifier {
        Identifier {
            bytes: IdBytes::Sixteen(bytes),
            hex: Arc::from(hex_of(&bytes)),
        }
    }

    /// Parses an identifier from its hex rendering; 16 hex characters
    /// yield an 8-byte identifier, 32 a 16-byte one. The empty string
    /// parses to the empty identifier.
    pub fn from_hex(hex: &str) -> Result<Identifier, IdentifierError> {
        match hex.len() {
            0 => Ok(Identifier::empty()),
            16 => {
                let mut bytes = [0u8; 8];
                parse_hex(hex, &mut bytes)?;
                Ok(Identifier::from_bytes_8(bytes))
            }
            32 => {
                let mut bytes = [0u8; 16];
                parse_hex(hex, &mut bytes)?;
                Ok(Identifier::from_bytes_16(bytes))
            }
            other => Err(IdentifierError::InvalidLength(other)),
        }
    }

    /// `true` for the empty sentinel.
    pub fn is_empty(&self) -> bool {
        matches!(self.bytes, IdBytes::Empty)
    }

    /// The identifier bytes; empty slice for the sentinel.
    pub fn bytes(&self) -> &[u8] {
        match &self.bytes {
            IdBytes::Empty => &[],
            IdBytes::Eight(b) => b,
            IdBytes::Sixteen(b) => b,
        }
    }

    /// The cached lowercase hex rendering.
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Identifier {}

impl std::hash::Hash for Identifier {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Identifier(empty)")
        } else {
            write!(f, "Identifier({})", self.hex)
        }
    }
}

fn hex_of(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from_digit((byte >> 4) as u32, 16).expect("nibble in range"));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).expect("nibble in range"));
    }
    out
}

fn parse_hex(hex: &str, out: &mut [u8]) -> Result<(), IdentifierError> {
    let digits = hex.as_bytes();
    for (i, slot) in out.iter_mut().enumerate() {
        let high = (digits[i * 2] as char)
            .to_digit(16)
            .ok_or(IdentifierError::InvalidCharacter)?;
        let low = (digits[i * 2 + 1] as char)
            .to_digit(16)
            .ok_or(IdentifierError::InvalidCharacter)?;
        *slot = ((high << 4) | low) as u8;
    }
    Ok(())
}

/// Generates and parses trace and span identifiers.
pub trait IdentifierScheme: Send + Sync + fmt::Debug {
    /// Generates a new trace identifier.
    fn new_trace_id(&self) -> Identifier;

    /// Generates a new span identifier.
    fn new_span_id(&self) -> Identifier;
}

/// The `single` scheme: 8-byte trace and span identifiers.
#[derive(Clone, Debug, Default)]
pub struct SingleScheme {
    _private: (),
}

impl IdentifierScheme for SingleScheme {
    fn new_trace_id(&self) -> Identifier {
        CURRENT_RNG.with(|rng| Identifier::from_bytes_8(rng.borrow_mut().gen::<u64>().to_be_bytes()))
    }

    fn new_span_id(&self) -> Identifier {
        CURRENT_RNG.with(|rng| Identifier::from_bytes_8(rng.borrow_mut().gen::<u64>().to_be_bytes()))
    }
}

/// The `double` scheme: 16-byte trace identifiers, 8-byte span
/// identifiers.
#[derive(Clone, Debug, Default)]
pub struct DoubleScheme {
    _private: (),
}

impl IdentifierScheme for DoubleScheme {
    fn new_trace_id(&self) -> Identifier {
        CURRENT_RNG
            .with(|rng| Identifier::from_bytes_16(rng.borrow_mut().gen::<u128>().to_be_bytes()))
    }

    fn new_span_id(&self) -> Identifier {
        CURRENT_RNG.with(|rng| Identifier::from_bytes_8(rng.borrow_mut().gen::<u64>().to_be_bytes()))
    }
}
