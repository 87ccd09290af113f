//! Byte-level object serialization: the compact form used for normal
//! output and the indented form used in qdf mode. All number formatting is
//! locale independent.

use crate::object::{Dictionary, Object, StringFormat};

pub(crate) fn serialized(object: &Object) -> Vec<u8> {
    let mut out = Vec::new();
    write_object(&mut out, object);
    out
}

pub(crate) fn write_object(out: &mut Vec<u8>, object: &Object) {
    match object {
        Object::Null => out.extend_from_slice(b"null"),
        Object::Boolean(true) => out.extend_from_slice(b"true"),
        Object::Boolean(false) => out.extend_from_slice(b"false"),
        Object::Integer(value) => write_integer(out, *value),
        Object::Real(real) => out.extend_from_slice(real.lexeme().as_bytes()),
        Object::String(bytes, StringFormat::Literal) => write_literal_string(out, bytes),
        Object::String(bytes, StringFormat::Hexadecimal) => write_hex_string(out, bytes),
        Object::Name(name) => write_name(out, name),
        Object::Array(items) => {
            out.push(b'[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(b' ');
                }
                write_object(out, item);
            }
            out.push(b']');
        }
        Object::Dictionary(dict) => write_dictionary(out, dict),
        Object::Stream(stream) => {
            // Streams are emitted by the writer, which owns the payload
            // decisions; this form only appears in diagnostics.
            write_dictionary(out, &stream.dict);
        }
        Object::Reference((id, generation)) => {
            write_integer(out, *id as i64);
            out.push(b' ');
            write_integer(out, *generation as i64);
            out.extend_from_slice(b" R");
        }
        Object::Reserved | Object::Destroyed => out.extend_from_slice(b"null"),
    }
}

pub(crate) fn write_dictionary(out: &mut Vec<u8>, dict: &Dictionary) {
    out.extend_from_slice(b"<<");
    for (key, value) in dict.iter() {
        write_name(out, key);
        out.push(b' ');
        write_object(out, value);
    }
    out.extend_from_slice(b">>");
}

pub(crate) fn write_integer(out: &mut Vec<u8>, value: i64) {
    let mut buffer = itoa::Buffer::new();
    out.extend_from_slice(buffer.format(value).as_bytes());
}

pub(crate) fn write_name(out: &mut Vec<u8>, name: &[u8]) {
    out.push(b'/');
    for &byte in name {
        // Delimiters, '#', and anything outside the printable range get
        // hex-escaped; the NUL sentinel from a damaged #00 becomes #00
        // again.
        if byte == b'#' || !(0x21..=0x7E).contains(&byte) || crate::tokenizer::is_delimiter(byte) {
            out.push(b'#');
            out.push(HEX_DIGITS[(byte >> 4) as usize]);
            out.push(HEX_DIGITS[(byte & 0x0F) as usize]);
        } else {
            out.push(byte);
        }
    }
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

pub(crate) fn write_literal_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(b'(');
    for &byte in bytes {
        match byte {
            b'(' | b')' | b'\\' => {
                out.push(b'\\');
                out.push(byte);
            }
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            0x08 => out.extend_from_slice(b"\\b"),
            0x0C => out.extend_from_slice(b"\\f"),
            _ => out.push(byte),
        }
    }
    out.push(b')');
}

pub(crate) fn write_hex_string(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(b'<');
    for &byte in bytes {
        out.push(HEX_DIGITS[(byte >> 4) as usize]);
        out.push(HEX_DIGITS[(byte & 0x0F) as usize]);
    }
    out.push(b'>');
}

/// The indented rendering used in qdf mode.
pub(crate) fn write_object_qdf(out: &mut Vec<u8>, object: &Object, indent: usize) {
    match object {
        Object::Array(items) => {
            out.extend_from_slice(b"[\n");
            for item in items {
                push_indent(out, indent + 1);
                write_object_qdf(out, item, indent + 1);
                out.push(b'\n');
            }
            push_indent(out, indent);
            out.push(b']');
        }
        Object::Dictionary(dict) => write_dictionary_qdf(out, dict, indent),
        Object::Stream(stream) => write_dictionary_qdf(out, &stream.dict, indent),
        other => write_object(out, other),
    }
}

pub(crate) fn write_dictionary_qdf(out: &mut Vec<u8>, dict: &Dictionary, indent: usize) {
    out.extend_from_slice(b"<<\n");
    for (key, value) in dict.iter() {
        push_indent(out, indent + 1);
        write_name(out, key);
        out.push(b' ');
        write_object_qdf(out, value, indent + 1);
        out.push(b'\n');
    }
    push_indent(out, indent);
    out.extend_from_slice(b">>");
}

fn push_indent(out: &mut Vec<u8>, indent: usize) {
    for _ in 0..indent {
        out.extend_from_slice(b"  ");
    }
}
