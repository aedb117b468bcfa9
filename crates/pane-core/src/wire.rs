//! Binary wire encoding for screen traffic.
//!
//! Every frame on a connection is a 4-byte big-endian length, a 1-byte
//! format tag ([`FORMAT_JSON`] or [`FORMAT_BINARY`]), then `length - 1`
//! payload bytes. This module implements the binary payload form used
//! for snapshots, deltas, input, and resize; requests and responses
//! are JSON-only and rejected here.
//!
//! All multi-byte integers are big-endian. Cell characters carry a
//! `u8` length (they hold single graphemes); input data carries a
//! `u32` length (it is arbitrary). That asymmetry is part of the wire
//! contract.

use crate::error::CodecError;
use crate::protocol::{InputMessage, ResizeMessage, WireMessage};
use crate::screen::{Attribute, Cell, Color, ScreenDelta, ScreenSnapshot, Style};

/// Frame format tag for a JSON payload.
pub const FORMAT_JSON: u8 = 0;
/// Frame format tag for a binary payload.
pub const FORMAT_BINARY: u8 = 1;

const TAG_REQUEST: u8 = 0;
const TAG_RESPONSE: u8 = 1;
const TAG_SNAPSHOT: u8 = 2;
const TAG_DELTA: u8 = 3;
const TAG_INPUT: u8 = 4;
const TAG_RESIZE: u8 = 5;

const COLOR_DEFAULT: u8 = 0;
const COLOR_DEFAULT_INVERTED: u8 = 1;
const COLOR_ANSI: u8 = 2;
const COLOR_TRUE: u8 = 3;

/// Encode a message into its binary payload (without framing).
pub fn encode_binary(message: &WireMessage) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::with_capacity(64);
    match message {
        WireMessage::Snapshot { snapshot } => {
            buf.push(TAG_SNAPSHOT);
            put_u16(&mut buf, snapshot.cols);
            put_u16(&mut buf, snapshot.rows);
            put_u16(&mut buf, snapshot.cursor_x);
            put_u16(&mut buf, snapshot.cursor_y);
            buf.push(snapshot.is_alternate as u8);
            put_lines(&mut buf, &snapshot.lines);
        }
        WireMessage::Delta { delta } => {
            buf.push(TAG_DELTA);
            put_u16(&mut buf, delta.start_y);
            put_u16(&mut buf, delta.end_y);
            put_u16(&mut buf, delta.cursor_x);
            put_u16(&mut buf, delta.cursor_y);
            put_lines(&mut buf, &delta.lines);
        }
        WireMessage::Input { input } => {
            buf.push(TAG_INPUT);
            let data = input.data.as_bytes();
            put_u32(&mut buf, data.len() as u32);
            buf.extend_from_slice(data);
        }
        WireMessage::Resize { resize } => {
            buf.push(TAG_RESIZE);
            put_u16(&mut buf, resize.cols);
            put_u16(&mut buf, resize.rows);
        }
        WireMessage::Request { .. } => return Err(CodecError::JsonOnly("request")),
        WireMessage::Response { .. } => return Err(CodecError::JsonOnly("response")),
    }
    Ok(buf)
}

/// Decode a binary payload (without framing) into a message.
///
/// Trailing bytes after a complete message are ignored for forward
/// compatibility.
pub fn decode_binary(payload: &[u8]) -> Result<WireMessage, CodecError> {
    let mut reader = Reader::new(payload);
    let tag = reader.u8()?;
    match tag {
        TAG_SNAPSHOT => {
            let cols = reader.u16()?;
            let rows = reader.u16()?;
            let cursor_x = reader.u16()?;
            let cursor_y = reader.u16()?;
            let is_alternate = reader.u8()? != 0;
            let lines = read_lines(&mut reader)?;
            Ok(WireMessage::Snapshot {
                snapshot: ScreenSnapshot {
                    cols,
                    rows,
                    cursor_x,
                    cursor_y,
                    is_alternate,
                    lines,
                },
            })
        }
        TAG_DELTA => {
            let start_y = reader.u16()?;
            let end_y = reader.u16()?;
            let cursor_x = reader.u16()?;
            let cursor_y = reader.u16()?;
            let lines = read_lines(&mut reader)?;
            Ok(WireMessage::Delta {
                delta: ScreenDelta {
                    start_y,
                    end_y,
                    cursor_x,
                    cursor_y,
                    lines,
                },
            })
        }
        TAG_INPUT => {
            let len = reader.u32()? as usize;
            let bytes = reader.bytes(len)?;
            let data = String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)?;
            Ok(WireMessage::Input {
                input: InputMessage { data },
            })
        }
        TAG_RESIZE => {
            let cols = reader.u16()?;
            let rows = reader.u16()?;
            Ok(WireMessage::Resize {
                resize: ResizeMessage { cols, rows },
            })
        }
        // Control messages never appear in binary frames.
        TAG_REQUEST | TAG_RESPONSE => Err(CodecError::InvalidTag(tag)),
        other => Err(CodecError::InvalidTag(other)),
    }
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_lines(buf: &mut Vec<u8>, lines: &[Vec<Cell>]) {
    put_u16(buf, lines.len() as u16);
    for line in lines {
        put_u16(buf, line.len() as u16);
        for cell in line {
            put_cell(buf, cell);
        }
    }
}

fn put_cell(buf: &mut Vec<u8>, cell: &Cell) {
    if cell.ch.len() > u8::MAX as usize {
        // A cell holds a single grapheme; anything larger is replaced
        // rather than emitting a length we cannot represent.
        buf.push(1);
        buf.push(b' ');
    } else {
        buf.push(cell.ch.len() as u8);
        buf.extend_from_slice(cell.ch.as_bytes());
    }
    buf.push(cell.width as u8);
    put_attribute(buf, &cell.attr);
}

fn put_attribute(buf: &mut Vec<u8>, attr: &Attribute) {
    put_color(buf, attr.fg);
    put_color(buf, attr.bg);
    buf.push(attr.style.0);
    match attr.underline_color {
        Some(color) => {
            buf.push(1);
            put_color(buf, color);
        }
        None => buf.push(0),
    }
}

fn put_color(buf: &mut Vec<u8>, color: Color) {
    match color {
        Color::Default => buf.push(COLOR_DEFAULT),
        Color::DefaultInverted => buf.push(COLOR_DEFAULT_INVERTED),
        Color::Ansi { index } => {
            buf.push(COLOR_ANSI);
            buf.push(index);
        }
        Color::TrueColor { r, g, b } => {
            buf.push(COLOR_TRUE);
            buf.push(r);
            buf.push(g);
            buf.push(b);
        }
    }
}

fn read_lines(reader: &mut Reader<'_>) -> Result<Vec<Vec<Cell>>, CodecError> {
    let line_count = reader.u16()? as usize;
    let mut lines = Vec::with_capacity(line_count);
    for _ in 0..line_count {
        let cell_count = reader.u16()? as usize;
        let mut cells = Vec::with_capacity(cell_count);
        for _ in 0..cell_count {
            cells.push(read_cell(reader)?);
        }
        lines.push(cells);
    }
    Ok(lines)
}

fn read_cell(reader: &mut Reader<'_>) -> Result<Cell, CodecError> {
    let char_len = reader.u8()? as usize;
    let bytes = reader.bytes(char_len)?;
    let ch = std::str::from_utf8(bytes)
        .map_err(|_| CodecError::InvalidUtf8)?
        .to_string();
    let width = reader.u8()? as i8;
    let attr = read_attribute(reader)?;
    Ok(Cell { ch, width, attr })
}

fn read_attribute(reader: &mut Reader<'_>) -> Result<Attribute, CodecError> {
    let fg = read_color(reader)?;
    let bg = read_color(reader)?;
    let style = Style(reader.u8()?);
    let underline_color = if reader.u8()? != 0 {
        Some(read_color(reader)?)
    } else {
        None
    };
    Ok(Attribute {
        fg,
        bg,
        style,
        underline_color,
    })
}

fn read_color(reader: &mut Reader<'_>) -> Result<Color, CodecError> {
    match reader.u8()? {
        COLOR_DEFAULT => Ok(Color::Default),
        COLOR_DEFAULT_INVERTED => Ok(Color::DefaultInverted),
        COLOR_ANSI => Ok(Color::Ansi { index: reader.u8()? }),
        COLOR_TRUE => Ok(Color::TrueColor {
            r: reader.u8()?,
            g: reader.u8()?,
            b: reader.u8()?,
        }),
        other => Err(CodecError::InvalidTag(other)),
    }
}

/// Cursor-based payload reader. Consuming past the end yields
/// [`CodecError::UnexpectedEnd`] and leaves nothing half-applied.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        let byte = *self.buf.get(self.pos).ok_or(CodecError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEnd)?;
        if end > self.buf.len() {
            return Err(CodecError::UnexpectedEnd);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Request;
    use crate::screen::line_text;

    fn cell(ch: &str, width: i8, attr: Attribute) -> Cell {
        Cell {
            ch: ch.to_string(),
            width,
            attr,
        }
    }

    fn styled_attr() -> Attribute {
        Attribute {
            fg: Color::Ansi { index: 2 },
            bg: Color::TrueColor { r: 10, g: 20, b: 30 },
            style: Style::BOLD | Style::UNDERLINE,
            underline_color: Some(Color::Ansi { index: 5 }),
        }
    }

    #[test]
    fn resize_encoding_is_bit_exact() {
        let msg = WireMessage::Resize {
            resize: ResizeMessage { cols: 100, rows: 30 },
        };
        let bytes = encode_binary(&msg).unwrap();
        assert_eq!(bytes, vec![5, 0, 100, 0, 30]);
        assert_eq!(decode_binary(&bytes).unwrap(), msg);
    }

    #[test]
    fn input_uses_u32_length() {
        let msg = WireMessage::Input {
            input: InputMessage { data: "ls\r".into() },
        };
        let bytes = encode_binary(&msg).unwrap();
        assert_eq!(bytes, vec![4, 0, 0, 0, 3, b'l', b's', b'\r']);
        assert_eq!(decode_binary(&bytes).unwrap(), msg);
    }

    #[test]
    fn snapshot_round_trips() {
        let snapshot = ScreenSnapshot {
            cols: 4,
            rows: 2,
            cursor_x: 1,
            cursor_y: 0,
            is_alternate: true,
            lines: vec![
                vec![
                    cell("a", 1, Attribute::default()),
                    cell("漢", 2, styled_attr()),
                    cell("", 0, styled_attr()),
                    cell(" ", 1, Attribute::default()),
                ],
                vec![
                    cell(" ", 1, Attribute::default()),
                    cell(" ", 1, Attribute::default()),
                    cell(" ", 1, Attribute::default()),
                    cell(" ", 1, Attribute::default()),
                ],
            ],
        };
        let msg = WireMessage::Snapshot { snapshot };
        let bytes = encode_binary(&msg).unwrap();
        assert_eq!(decode_binary(&bytes).unwrap(), msg);
    }

    #[test]
    fn delta_round_trips() {
        let delta = ScreenDelta {
            start_y: 3,
            end_y: 4,
            cursor_x: 0,
            cursor_y: 4,
            lines: vec![
                vec![cell("x", 1, Attribute::default())],
                vec![cell("y", 1, styled_attr())],
            ],
        };
        let msg = WireMessage::Delta { delta };
        let bytes = encode_binary(&msg).unwrap();
        let decoded = decode_binary(&bytes).unwrap();
        assert_eq!(decoded, msg);
        if let WireMessage::Delta { delta } = decoded {
            assert_eq!(delta.lines.len(), (delta.end_y - delta.start_y + 1) as usize);
            assert_eq!(line_text(&delta.lines[0]), "x");
        }
    }

    #[test]
    fn all_color_variants_round_trip() {
        for color in [
            Color::Default,
            Color::DefaultInverted,
            Color::Ansi { index: 255 },
            Color::TrueColor { r: 0, g: 128, b: 255 },
        ] {
            let msg = WireMessage::Delta {
                delta: ScreenDelta {
                    start_y: 0,
                    end_y: 0,
                    cursor_x: 0,
                    cursor_y: 0,
                    lines: vec![vec![cell(
                        "z",
                        1,
                        Attribute {
                            fg: color,
                            bg: color,
                            style: Style::default(),
                            underline_color: Some(color),
                        },
                    )]],
                },
            };
            let bytes = encode_binary(&msg).unwrap();
            assert_eq!(decode_binary(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn unknown_style_bits_are_preserved() {
        let msg = WireMessage::Delta {
            delta: ScreenDelta {
                start_y: 0,
                end_y: 0,
                cursor_x: 0,
                cursor_y: 0,
                lines: vec![vec![cell(
                    "s",
                    1,
                    Attribute {
                        fg: Color::Default,
                        bg: Color::Default,
                        style: Style(0xff),
                        underline_color: None,
                    },
                )]],
            },
        };
        let bytes = encode_binary(&msg).unwrap();
        let decoded = decode_binary(&bytes).unwrap();
        if let WireMessage::Delta { delta } = decoded {
            assert_eq!(delta.lines[0][0].attr.style, Style(0xff));
        } else {
            panic!("expected delta");
        }
    }

    #[test]
    fn short_buffer_is_unexpected_end() {
        let msg = WireMessage::Input {
            input: InputMessage { data: "hello".into() },
        };
        let bytes = encode_binary(&msg).unwrap();
        for len in 0..bytes.len() {
            assert_eq!(
                decode_binary(&bytes[..len]),
                Err(CodecError::UnexpectedEnd),
                "truncation at {len} should fail cleanly"
            );
        }
    }

    #[test]
    fn unknown_message_tag_is_rejected() {
        assert_eq!(decode_binary(&[9]), Err(CodecError::InvalidTag(9)));
    }

    #[test]
    fn control_tags_are_rejected_in_binary() {
        assert_eq!(decode_binary(&[0]), Err(CodecError::InvalidTag(0)));
        assert_eq!(decode_binary(&[1]), Err(CodecError::InvalidTag(1)));
    }

    #[test]
    fn control_messages_cannot_be_binary_encoded() {
        let request = WireMessage::Request {
            request: Request::Ping,
        };
        assert_eq!(
            encode_binary(&request),
            Err(CodecError::JsonOnly("request"))
        );
        let response = WireMessage::Response {
            response: crate::protocol::Response::success(),
        };
        assert_eq!(
            encode_binary(&response),
            Err(CodecError::JsonOnly("response"))
        );
    }

    #[test]
    fn invalid_utf8_in_input_is_rejected() {
        // tag, u32 len=2, invalid utf-8 continuation bytes
        let bytes = vec![4, 0, 0, 0, 2, 0xc3, 0x28];
        assert_eq!(decode_binary(&bytes), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn invalid_utf8_in_cell_char_is_rejected() {
        // delta header (start, end, cursor, lineCount=1, cellCount=1),
        // then a cell whose char bytes are not utf-8
        let mut bytes = vec![3];
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 1]);
        bytes.push(1);
        bytes.push(0xff);
        assert_eq!(decode_binary(&bytes), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn unknown_color_variant_is_invalid_tag() {
        // delta with one cell whose fg color variant is 7
        let mut bytes = vec![3];
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 1]);
        bytes.push(1);
        bytes.push(b'a');
        bytes.push(1); // width
        bytes.push(7); // bogus color variant
        assert_eq!(decode_binary(&bytes), Err(CodecError::InvalidTag(7)));
    }

    #[test]
    fn trailing_bytes_are_tolerated() {
        let msg = WireMessage::Resize {
            resize: ResizeMessage { cols: 80, rows: 24 },
        };
        let mut bytes = encode_binary(&msg).unwrap();
        bytes.extend_from_slice(&[0xde, 0xad]);
        assert_eq!(decode_binary(&bytes).unwrap(), msg);
    }
}
