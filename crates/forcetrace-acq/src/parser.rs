//! Text frame parsing for the sensor board's serial protocol.
//!
//! The board emits one record per line:
//!
//! ```text
//! Time:1234,V1:512,V2:-3.5,V3:0,V4:1021
//! ```
//!
//! The time field is an optionally signed integer (milliseconds); channel
//! values are optionally signed, optionally fractional decimals.

use forcetrace_core::{Frame, ParseFailure, DEFAULT_CHANNEL_COUNT};
use serde::{Deserialize, Serialize};

/// Grammar parameters for a session's frame format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Number of value fields per frame
    pub channel_count: usize,

    /// Tag introducing the time field
    pub time_tag: String,

    /// Prefix of channel tags; channel `i` uses `{prefix}{i + 1}`
    pub channel_prefix: String,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            channel_count: DEFAULT_CHANNEL_COUNT,
            time_tag: "Time".to_string(),
            channel_prefix: "V".to_string(),
        }
    }
}

impl ParserConfig {
    pub fn with_channels(channel_count: usize) -> Self {
        Self {
            channel_count,
            ..Self::default()
        }
    }
}

/// Parser for the tagged, comma-separated frame grammar
#[derive(Debug, Clone)]
pub struct FrameParser {
    config: ParserConfig,
    channel_tags: Vec<String>,
}

impl FrameParser {
    pub fn new(config: ParserConfig) -> Self {
        let channel_tags = (1..=config.channel_count)
            .map(|i| format!("{}{}", config.channel_prefix, i))
            .collect();

        Self {
            config,
            channel_tags,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.config.channel_count
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Parse one line into a frame.
    ///
    /// Surrounding whitespace (including the line terminator) is ignored;
    /// everything else must match the grammar exactly.
    pub fn parse(&self, raw: &str) -> Result<Frame, ParseFailure> {
        let line = raw.trim();
        if line.is_empty() {
            return Err(ParseFailure::Empty);
        }

        let expected_fields = self.config.channel_count + 1;
        let mut fields = line.split(',');

        let time_text = Self::field_value(fields.next(), 0, &self.config.time_tag)?;
        let device_time = Self::parse_integer(time_text)
            .ok_or_else(|| ParseFailure::InvalidNumber {
                index: 0,
                value: time_text.to_string(),
            })?;

        let mut channels = Vec::with_capacity(self.config.channel_count);
        for (offset, tag) in self.channel_tags.iter().enumerate() {
            let index = offset + 1;
            let field = match fields.next() {
                Some(field) => field,
                None if offset > 0 => {
                    return Err(ParseFailure::ChannelCount {
                        expected: self.config.channel_count,
                        actual: offset,
                    })
                }
                None => return Err(ParseFailure::MissingField { index }),
            };

            let text = Self::field_value(Some(field), index, tag)?;
            let value = Self::parse_decimal(text).ok_or_else(|| ParseFailure::InvalidNumber {
                index,
                value: text.to_string(),
            })?;
            channels.push(value);
        }

        if fields.next().is_some() {
            return Err(ParseFailure::TrailingInput {
                index: expected_fields - 1,
            });
        }

        Ok(Frame::new(device_time, channels))
    }

    /// Render a frame in the device's wire format
    pub fn format(&self, frame: &Frame) -> String {
        let mut line = format!("{}:{}", self.config.time_tag, frame.device_time);
        for (tag, value) in self.channel_tags.iter().zip(&frame.channels) {
            line.push_str(&format!(",{}:{}", tag, value));
        }
        line
    }

    fn field_value<'a>(
        field: Option<&'a str>,
        index: usize,
        expected_tag: &str,
    ) -> Result<&'a str, ParseFailure> {
        let field = field.ok_or(ParseFailure::MissingField { index })?;
        let (tag, value) = field
            .split_once(':')
            .ok_or(ParseFailure::MissingField { index })?;

        if tag != expected_tag {
            return Err(ParseFailure::TagMismatch {
                index,
                expected: expected_tag.to_string(),
                found: tag.to_string(),
            });
        }

        Ok(value)
    }

    /// `-?\d+`
    fn parse_integer(text: &str) -> Option<i64> {
        let digits = text.strip_prefix('-').unwrap_or(text);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        text.parse().ok()
    }

    /// `-?\d+(\.\d+)?`
    fn parse_decimal(text: &str) -> Option<f64> {
        let unsigned = text.strip_prefix('-').unwrap_or(text);
        let (int_part, frac_part) = match unsigned.split_once('.') {
            Some((int_part, frac_part)) => (int_part, Some(frac_part)),
            None => (unsigned, None),
        };

        let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(int_part) || !frac_part.map_or(true, all_digits) {
            return None;
        }

        text.parse().ok()
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(ParserConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_frame() {
        let parser = FrameParser::default();
        let frame = parser.parse("Time:10,V1:12,V2:11.5,V3:-9,V4:-0.25\r\n").unwrap();

        assert_eq!(frame.device_time, 10);
        assert_eq!(frame.channels, vec![12.0, 11.5, -9.0, -0.25]);
    }

    #[test]
    fn test_format_then_parse() {
        let parser = FrameParser::default();
        let frames = [
            Frame::new(0, vec![10.0, 10.0, 10.0, 10.0]),
            Frame::new(-42, vec![-1.5, 0.0, 1023.0, 7.125]),
            Frame::new(987_654_321, vec![512.0, 513.5, 514.0, 515.25]),
        ];

        for frame in frames {
            let line = parser.format(&frame);
            assert_eq!(parser.parse(&line).unwrap(), frame, "line: {line}");
        }
    }

    #[test]
    fn test_configurable_channel_count() {
        let parser = FrameParser::new(ParserConfig::with_channels(2));

        let frame = parser.parse("Time:5,V1:1,V2:2").unwrap();
        assert_eq!(frame.channel_count(), 2);

        assert!(parser.parse("Time:5,V1:1,V2:2,V3:3").is_err());
    }

    #[test]
    fn test_malformed_lines_rejected() {
        let parser = FrameParser::default();

        assert_eq!(parser.parse("   "), Err(ParseFailure::Empty));
        assert!(matches!(
            parser.parse("Tme:0,V1:1,V2:2,V3:3,V4:4"),
            Err(ParseFailure::TagMismatch { index: 0, .. })
        ));
        assert!(matches!(
            parser.parse("Time:0,V1:1,V3:2,V2:3,V4:4"),
            Err(ParseFailure::TagMismatch { index: 2, .. })
        ));
        assert!(matches!(
            parser.parse("Time:0,V1:1,V2:2,V3:3"),
            Err(ParseFailure::ChannelCount { expected: 4, actual: 3 })
        ));
        assert!(matches!(
            parser.parse("Time:0"),
            Err(ParseFailure::MissingField { index: 1 })
        ));
        assert!(matches!(
            parser.parse("Time:0,V1:abc,V2:2,V3:3,V4:4"),
            Err(ParseFailure::InvalidNumber { index: 1, .. })
        ));
        assert!(matches!(
            parser.parse("Time:1.5,V1:1,V2:2,V3:3,V4:4"),
            Err(ParseFailure::InvalidNumber { index: 0, .. })
        ));
        assert!(matches!(
            parser.parse("Time:0,V1:1,V2:2,V3:3,V4:4,V5:5"),
            Err(ParseFailure::TrailingInput { .. })
        ));
    }

    #[test]
    fn test_number_grammar_is_strict() {
        let parser = FrameParser::default();

        for bad in ["1.", ".5", "+1", "1e3", "--1", "NaN", "inf", " 1", ""] {
            let line = format!("Time:0,V1:{bad},V2:2,V3:3,V4:4");
            assert!(parser.parse(&line).is_err(), "accepted `{bad}`");
        }
    }
}
