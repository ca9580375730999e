use core::fmt;

use crate::id::GeneratorConfig;

/// A packed 64-bit identifier.
///
/// The raw value is the only externally meaningful contract:
/// `[sign:1][timestamp][instance][sequence]`, most significant bit first.
/// An `Identifier` does not carry its layout, so decoding takes the
/// [`GeneratorConfig`] it was minted with.
///
/// # Example
///
/// ```
/// use slotflake::{GeneratorConfig, Identifier};
///
/// let config = GeneratorConfig::default();
/// let id = Identifier::from_components(&config, 1000, 2, 1);
/// let parts = id.decode(&config);
/// assert_eq!(parts.timestamp, 1000);
/// assert_eq!(parts.instance, 2);
/// assert_eq!(parts.sequence, 1);
/// ```
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier {
    id: u64,
}

/// The decoded fields of an [`Identifier`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct IdParts {
    /// Milliseconds since the layout epoch.
    pub timestamp: u64,
    /// Combined instance value (static pair, leased slot or fallback).
    pub instance: u64,
    pub sequence: u64,
}

impl Identifier {
    /// Packs the three fields. Each value is masked to its field width; the
    /// generator validates widths before calling this.
    pub const fn from_components(
        config: &GeneratorConfig,
        timestamp: u64,
        instance: u64,
        sequence: u64,
    ) -> Self {
        debug_assert!(timestamp <= config.max_timestamp(), "timestamp overflow");
        debug_assert!(instance <= config.max_instance(), "instance overflow");
        debug_assert!(sequence <= config.max_sequence(), "sequence overflow");
        let timestamp = (timestamp & config.max_timestamp()) << config.timestamp_shift();
        let instance = (instance & config.max_instance()) << config.instance_shift();
        let sequence = sequence & config.max_sequence();
        Self {
            id: timestamp | instance | sequence,
        }
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self { id: raw }
    }

    pub const fn to_raw(&self) -> u64 {
        self.id
    }

    pub const fn timestamp(&self, config: &GeneratorConfig) -> u64 {
        (self.id >> config.timestamp_shift()) & config.max_timestamp()
    }

    pub const fn instance(&self, config: &GeneratorConfig) -> u64 {
        (self.id >> config.instance_shift()) & config.max_instance()
    }

    pub const fn sequence(&self, config: &GeneratorConfig) -> u64 {
        self.id & config.max_sequence()
    }

    /// Recovers the `(timestamp, instance, sequence)` triple.
    pub const fn decode(&self, config: &GeneratorConfig) -> IdParts {
        IdParts {
            timestamp: self.timestamp(config),
            instance: self.instance(config),
            sequence: self.sequence(config),
        }
    }

    /// Wall-clock creation time in milliseconds since the Unix epoch.
    pub const fn unix_millis(&self, config: &GeneratorConfig) -> u64 {
        config.epoch_millis() + self.timestamp(config)
    }

    /// Returns the ID as a zero-padded 20-digit string.
    pub fn to_padded_string(&self) -> String {
        format!("{:020}", self.id)
    }

    /// Renders the bit layout of this identifier under `config`.
    pub fn layout<'a>(&'a self, config: &'a GeneratorConfig) -> LayoutDisplay<'a> {
        LayoutDisplay { id: self, config }
    }
}

impl From<u64> for Identifier {
    fn from(raw: u64) -> Self {
        Self::from_raw(raw)
    }
}

impl From<Identifier> for u64 {
    fn from(id: Identifier) -> Self {
        id.to_raw()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Identifier")
            .field(&format_args!("0x{:016x}", self.id))
            .finish()
    }
}

struct FieldLayout {
    name: &'static str,
    bits: u8,
    value: u64,
}

/// Table rendering of an identifier's fields, see [`Identifier::layout`].
pub struct LayoutDisplay<'a> {
    id: &'a Identifier,
    config: &'a GeneratorConfig,
}

impl LayoutDisplay<'_> {
    fn fields(&self) -> [FieldLayout; 4] {
        let parts = self.id.decode(self.config);
        [
            FieldLayout {
                name: "reserved",
                bits: 64 - self.config.timestamp_shift() - self.config.timestamp_bits(),
                value: 0,
            },
            FieldLayout {
                name: "timestamp",
                bits: self.config.timestamp_bits(),
                value: parts.timestamp,
            },
            FieldLayout {
                name: "instance",
                bits: self.config.instance_bits(),
                value: parts.instance,
            },
            FieldLayout {
                name: "sequence",
                bits: self.config.sequence_bits(),
                value: parts.sequence,
            },
        ]
    }
}

impl fmt::Display for LayoutDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn center(s: impl ToString, width: usize) -> String {
            let s = s.to_string();
            let len = s.len();
            if len >= width {
                return s;
            }
            let pad = width - len;
            let left = pad / 2;
            let right = pad - left;
            format!("{}{}{}", " ".repeat(left), s, " ".repeat(right))
        }

        fn border(f: &mut fmt::Formatter<'_>, columns: &[usize]) -> fmt::Result {
            write!(f, "        +")?;
            for &w in columns {
                write!(f, "{}+", "-".repeat(w))?;
            }
            writeln!(f)
        }

        let fields = self.fields();
        let visible: Vec<_> = fields.iter().filter(|field| field.bits > 0).collect();
        let columns: Vec<usize> = visible
            .iter()
            .map(|field| {
                let label_len = format!("{} ({})", field.name, field.bits).len();
                let dec_len = field.value.to_string().len();
                let hex_len = format!("0x{:x}", field.value).len();
                label_len.max(dec_len).max(hex_len) + 2
            })
            .collect();

        writeln!(f, "Identifier {{")?;
        writeln!(f, "    raw id     : 0x{:016x} ({})", self.id.id, self.id.id)?;
        writeln!(f, "    padded     : {}", self.id.to_padded_string())?;
        writeln!(f, "    layout     :")?;

        border(f, &columns)?;
        write!(f, "        |")?;
        for (field, &w) in visible.iter().zip(&columns) {
            write!(f, "{}|", center(format!("{} ({})", field.name, field.bits), w))?;
        }
        writeln!(f)?;
        border(f, &columns)?;

        write!(f, "        |")?;
        for (field, &w) in visible.iter().zip(&columns) {
            write!(f, "{}|", center(field.value, w))?;
        }
        writeln!(f)?;

        write!(f, "        |")?;
        for (field, &w) in visible.iter().zip(&columns) {
            write!(f, "{}|", center(format!("0x{:x}", field.value), w))?;
        }
        writeln!(f)?;
        border(f, &columns)?;

        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_EPOCH;

    #[test]
    fn fields_and_bounds_round_trip() {
        let config = GeneratorConfig::default();
        let ts = config.max_timestamp();
        let inst = config.max_instance();
        let seq = config.max_sequence();

        let id = Identifier::from_components(&config, ts, inst, seq);
        assert_eq!(
            id.decode(&config),
            IdParts {
                timestamp: ts,
                instance: inst,
                sequence: seq
            }
        );
        // sign bit stays clear
        assert_eq!(id.to_raw() >> 63, 0);
        assert_eq!(id.to_raw(), i64::MAX as u64);
    }

    #[test]
    fn packs_fields_most_significant_first() {
        let config = GeneratorConfig::default();
        let id = Identifier::from_components(&config, 1, 1, 1);
        assert_eq!(id.to_raw(), (1 << 22) | (1 << 12) | 1);
    }

    #[test]
    fn custom_layout_decodes_exact_triple() {
        let config = GeneratorConfig::new(DEFAULT_EPOCH, 39, 16, 8).unwrap();
        let id = Identifier::from_components(&config, 123_456_789, 40_000, 200);
        let parts = id.decode(&config);
        assert_eq!(parts.timestamp, 123_456_789);
        assert_eq!(parts.instance, 40_000);
        assert_eq!(parts.sequence, 200);
        assert_eq!(id.unix_millis(&config), DEFAULT_EPOCH.as_millis() as u64 + 123_456_789);
    }

    #[test]
    fn ordering_follows_timestamp_first() {
        let config = GeneratorConfig::default();
        let early = Identifier::from_components(&config, 10, 1023, 4095);
        let late = Identifier::from_components(&config, 11, 0, 0);
        assert!(early < late);
    }

    #[test]
    fn layout_display_lists_every_field() {
        let config = GeneratorConfig::default();
        let id = Identifier::from_components(&config, 5, 6, 7);
        let rendered = id.layout(&config).to_string();
        assert!(rendered.contains("timestamp (41)"));
        assert!(rendered.contains("instance (10)"));
        assert!(rendered.contains("sequence (12)"));
        assert!(rendered.contains(&id.to_padded_string()));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serializes_as_bare_integer() {
        let id = Identifier::from_raw(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let back: Identifier = serde_json::from_str("42").unwrap();
        assert_eq!(back, id);
    }
}
