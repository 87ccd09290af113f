use std::collections::HashMap;

use log::warn;

use crate::error::DecryptionError;
use crate::{Dictionary, Document, Object};

/// The algorithm a crypt filter applies to stream or string data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptMethod {
    /// Identity: data passes through unchanged.
    #[default]
    None,
    /// RC4 with the per-object key (/CFM /V2).
    Rc4,
    /// AES-128-CBC with the per-object key (/CFM /AESV2).
    Aes128,
    /// AES-256-CBC with the file key (/CFM /AESV3).
    Aes256,
}

impl CryptMethod {
    pub fn is_aes(self) -> bool {
        matches!(self, CryptMethod::Aes128 | CryptMethod::Aes256)
    }

    fn from_cfm(name: &[u8]) -> Result<CryptMethod, DecryptionError> {
        match name {
            b"None" => Ok(CryptMethod::None),
            b"V2" => Ok(CryptMethod::Rc4),
            b"AESV2" => Ok(CryptMethod::Aes128),
            b"AESV3" => Ok(CryptMethod::Aes256),
            _ => Err(DecryptionError::InvalidCryptFilter),
        }
    }
}

/// The per-class crypt filter selection of a V4/V5 encryption dictionary.
#[derive(Debug, Clone, Default)]
pub struct CryptFilters {
    /// Named filters from /CF.
    pub named: HashMap<Vec<u8>, CryptMethod>,
    pub stream_method: CryptMethod,
    pub string_method: CryptMethod,
    pub embedded_file_method: CryptMethod,
}

impl CryptFilters {
    /// Resolve /CF, /StmF, /StrF and /EFF. Absent selectors mean Identity;
    /// /EFF defaults to the stream filter.
    pub fn decode(document: &Document, encrypt: &Dictionary) -> Result<CryptFilters, DecryptionError> {
        let mut named: HashMap<Vec<u8>, CryptMethod> = HashMap::new();
        named.insert(b"Identity".to_vec(), CryptMethod::None);

        if let Ok(cf) = encrypt.get(b"CF") {
            let cf = document
                .dereference(cf)
                .ok()
                .and_then(|(_, obj)| obj.as_dict().ok())
                .ok_or(DecryptionError::InvalidCryptFilter)?;
            for (name, filter) in cf.iter() {
                let filter = document
                    .dereference(filter)
                    .ok()
                    .and_then(|(_, obj)| obj.as_dict().ok())
                    .ok_or(DecryptionError::InvalidCryptFilter)?;
                let method = match filter.get(b"CFM").and_then(Object::as_name) {
                    Ok(cfm) => CryptMethod::from_cfm(cfm)?,
                    Err(_) => CryptMethod::None,
                };
                if let Ok(event) = filter.get(b"AuthEvent").and_then(Object::as_name) {
                    if event != b"DocOpen" {
                        warn!(
                            "crypt filter /{} uses unsupported auth event, treating as DocOpen",
                            String::from_utf8_lossy(name)
                        );
                    }
                }
                named.insert(name.clone(), method);
            }
        }

        let lookup = |key: &[u8]| -> Result<CryptMethod, DecryptionError> {
            match encrypt.get(key).and_then(Object::as_name) {
                Ok(selector) => named
                    .get(selector)
                    .copied()
                    .ok_or(DecryptionError::InvalidCryptFilter),
                Err(_) => Ok(CryptMethod::None),
            }
        };

        let stream_method = lookup(b"StmF")?;
        let string_method = lookup(b"StrF")?;
        let embedded_file_method = match encrypt.get(b"EFF").and_then(Object::as_name) {
            Ok(selector) => named
                .get(selector)
                .copied()
                .ok_or(DecryptionError::InvalidCryptFilter)?,
            Err(_) => stream_method,
        };

        Ok(CryptFilters {
            named,
            stream_method,
            string_method,
            embedded_file_method,
        })
    }

    /// The method for one stream, honoring a leading /Crypt filter in the
    /// stream's own filter chain.
    pub fn method_for_stream(&self, stream_dict: &Dictionary, default: CryptMethod) -> CryptMethod {
        let first_filter = match stream_dict.get_or_null(b"Filter") {
            Object::Name(name) => Some(name.clone()),
            Object::Array(array) => array.first().and_then(|f| f.as_name().ok().map(<[u8]>::to_vec)),
            _ => None,
        };
        if first_filter.as_deref() != Some(b"Crypt") {
            return default;
        }
        let parms = match stream_dict.get_or_null(b"DecodeParms") {
            Object::Dictionary(dict) => Some(dict.clone()),
            Object::Array(array) => array.first().and_then(|p| p.as_dict().ok().cloned()),
            _ => None,
        };
        let name = parms
            .as_ref()
            .and_then(|p| p.get(b"Name").and_then(Object::as_name).ok().map(<[u8]>::to_vec))
            .unwrap_or_else(|| b"Identity".to_vec());
        self.named.get(&name).copied().unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary;

    #[test]
    fn defaults_are_identity() {
        let document = Document::new();
        let encrypt = dictionary! { "Filter" => "Standard", "V" => 4 };
        let filters = CryptFilters::decode(&document, &encrypt).unwrap();
        assert_eq!(filters.stream_method, CryptMethod::None);
        assert_eq!(filters.string_method, CryptMethod::None);
    }

    #[test]
    fn standard_aes_layout() {
        let document = Document::new();
        let encrypt = dictionary! {
            "Filter" => "Standard",
            "V" => 4,
            "CF" => dictionary! {
                "StdCF" => dictionary! { "CFM" => "AESV2", "AuthEvent" => "DocOpen" },
            },
            "StmF" => "StdCF",
            "StrF" => "StdCF",
        };
        let filters = CryptFilters::decode(&document, &encrypt).unwrap();
        assert_eq!(filters.stream_method, CryptMethod::Aes128);
        assert_eq!(filters.string_method, CryptMethod::Aes128);
        // EFF falls back to the stream method.
        assert_eq!(filters.embedded_file_method, CryptMethod::Aes128);
    }

    #[test]
    fn unknown_selector_is_an_error() {
        let document = Document::new();
        let encrypt = dictionary! {
            "Filter" => "Standard",
            "V" => 4,
            "StmF" => "Ghost",
        };
        assert!(CryptFilters::decode(&document, &encrypt).is_err());
    }

    #[test]
    fn per_stream_crypt_override() {
        let mut filters = CryptFilters::default();
        filters.named.insert(b"Identity".to_vec(), CryptMethod::None);
        filters.named.insert(b"Strong".to_vec(), CryptMethod::Aes128);

        let plain = dictionary! { "Filter" => "FlateDecode" };
        assert_eq!(filters.method_for_stream(&plain, CryptMethod::Rc4), CryptMethod::Rc4);

        let identity = dictionary! {
            "Filter" => "Crypt",
            "DecodeParms" => dictionary! { "Name" => "Identity" },
        };
        assert_eq!(filters.method_for_stream(&identity, CryptMethod::Rc4), CryptMethod::None);

        let named = dictionary! {
            "Filter" => "Crypt",
            "DecodeParms" => dictionary! { "Name" => "Strong" },
        };
        assert_eq!(filters.method_for_stream(&named, CryptMethod::Rc4), CryptMethod::Aes128);
    }
}
