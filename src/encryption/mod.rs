//! The standard security handler: key derivation, password checks, and
//! per-object encryption for V1/R2 through V5/R6.

pub(crate) mod crypt_filters;
pub(crate) mod rc4;

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use bitflags::bitflags;
use log::warn;
use md5::{Digest, Md5};
use rand::RngCore;
use sha2::{Sha256, Sha384, Sha512};

use crate::error::DecryptionError;
use crate::object::StreamData;
use crate::pipeline::{AesCbc, IvSource, Pipeline};
use crate::{Dictionary, Document, Error, Object, ObjectId, Result};

pub use crypt_filters::{CryptFilters, CryptMethod};
pub use rc4::rc4;

/// The 32-byte padding constant from the standard security handler.
pub(crate) const PAD: [u8; 32] = [
    0x28, 0xBF, 0x4E, 0x5E, 0x4E, 0x75, 0x8A, 0x41, 0x64, 0x00, 0x4E, 0x56, 0xFF, 0xFA, 0x01, 0x08, 0x2E, 0x2E, 0x00,
    0xB6, 0xD0, 0x68, 0x3E, 0x80, 0x2F, 0x0C, 0xA9, 0xFE, 0x64, 0x53, 0x69, 0x7A,
];

/// Fixed trailer bytes appended to the 16-byte /U digest for R3 and later.
const U_PAD_R3: [u8; 16] = [
    0x00, 0x21, 0x44, 0x69, 0x90, 0xB9, 0xE4, 0x11, 0x40, 0x71, 0xA4, 0xD9, 0x10, 0x49, 0x84, 0xC1,
];

bitflags! {
    /// The /P permission mask, 1-indexed bit numbers per the PDF spec.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u32 {
        /// Bit 3: print, possibly degraded.
        const PRINT = 1 << 2;
        /// Bit 4: modify other than the operations below.
        const MODIFY = 1 << 3;
        /// Bit 5: extract text and graphics (for R < 3 also accessibility).
        const EXTRACT = 1 << 4;
        /// Bit 6: add or modify annotations and fill forms.
        const MODIFY_ANNOTATIONS = 1 << 5;
        /// Bit 9: fill forms even when bit 6 is clear (R >= 3).
        const FILL_FORMS = 1 << 8;
        /// Bit 10: extract for accessibility (R >= 3).
        const EXTRACT_FOR_ACCESSIBILITY = 1 << 9;
        /// Bit 11: assemble (R >= 3).
        const ASSEMBLE = 1 << 10;
        /// Bit 12: print at full resolution (R >= 3).
        const PRINT_HIGH_RESOLUTION = 1 << 11;
    }
}

impl Permissions {
    /// The on-disk value: reserved bits 7, 8 and 13..32 are always set.
    pub fn p_value(&self) -> u32 {
        self.bits() | 0xFFFF_F0C0
    }

    pub fn from_p_value(p: u32) -> Permissions {
        Permissions::from_bits_truncate(p)
    }
}

/// Everything needed to decrypt or encrypt a document.
#[derive(Debug, Clone)]
pub struct EncryptionState {
    pub v: i64,
    pub r: i64,
    /// File key length in bytes.
    pub key_length: usize,
    /// The raw 32-bit /P value. Key derivation uses these exact bytes, so
    /// reserved bits from the source file are kept as found.
    pub p: u32,
    pub permissions: Permissions,
    pub o: Vec<u8>,
    pub u: Vec<u8>,
    pub oe: Vec<u8>,
    pub ue: Vec<u8>,
    pub perms: Vec<u8>,
    pub encrypt_metadata: bool,
    /// First element of the trailer /ID.
    pub id1: Vec<u8>,
    /// The derived (V < 5) or recovered (V = 5) file encryption key.
    pub file_key: Vec<u8>,
    pub crypt_filters: CryptFilters,
    pub user_password_matched: bool,
    pub owner_password_matched: bool,
}

impl EncryptionState {
    /// Read and authenticate against the document's /Encrypt dictionary.
    pub fn decode(document: &Document, password: &str) -> Result<EncryptionState> {
        let encrypt = document
            .trailer
            .get(b"Encrypt")
            .ok()
            .and_then(|obj| document.dereference(obj).ok())
            .and_then(|(_, obj)| obj.as_dict().ok())
            .ok_or(DecryptionError::InvalidEncryptDictionary)?;

        let filter = encrypt
            .get(b"Filter")
            .and_then(Object::as_name)
            .map_err(|_| DecryptionError::InvalidEncryptDictionary)?;
        if filter != b"Standard" {
            return Err(DecryptionError::UnsupportedFilter.into());
        }
        if encrypt.has(b"SubFilter") {
            warn!("/SubFilter in the encryption dictionary is ignored");
        }

        let v = encrypt.get(b"V").and_then(Object::as_i64).unwrap_or(0);
        let r = encrypt.get(b"R").and_then(Object::as_i64).unwrap_or(0);
        match (v, r) {
            (1, 2) | (1, 3) | (2, 2) | (2, 3) | (4, 4) | (5, 5) | (5, 6) => {}
            _ => return Err(DecryptionError::UnsupportedRevision.into()),
        }

        let key_length = if v >= 5 {
            32
        } else if v == 1 {
            5
        } else {
            let bits = encrypt.get(b"Length").and_then(Object::as_i64).unwrap_or(40);
            if !(40..=256).contains(&bits) || bits % 8 != 0 {
                return Err(DecryptionError::InvalidKeyLength.into());
            }
            (bits / 8) as usize
        };

        let p = encrypt
            .get(b"P")
            .and_then(Object::as_i64)
            .map_err(|_| DecryptionError::MissingEntry("P"))? as i32 as u32;

        let required_string = |key: &'static str| -> std::result::Result<Vec<u8>, DecryptionError> {
            encrypt
                .get(key.as_bytes())
                .and_then(Object::as_string_bytes)
                .map(<[u8]>::to_vec)
                .map_err(|_| DecryptionError::MissingEntry(key))
        };
        let mut o = required_string("O")?;
        let mut u = required_string("U")?;
        let ou_len = if r >= 5 { 48 } else { 32 };
        if o.len() < ou_len {
            o.resize(ou_len, 0);
        }
        if u.len() < ou_len {
            u.resize(ou_len, 0);
        }

        let (oe, ue, perms) = if v >= 5 {
            let mut oe = required_string("OE")?;
            let mut ue = required_string("UE")?;
            let mut perms = required_string("Perms")?;
            oe.resize(32, 0);
            ue.resize(32, 0);
            perms.resize(16, 0);
            (oe, ue, perms)
        } else {
            (Vec::new(), Vec::new(), Vec::new())
        };

        let encrypt_metadata = encrypt
            .get(b"EncryptMetadata")
            .and_then(Object::as_bool)
            .unwrap_or(true);

        let id1 = document
            .trailer
            .get(b"ID")
            .and_then(Object::as_array)
            .ok()
            .and_then(|id| id.first())
            .and_then(|first| first.as_string_bytes().ok())
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        if id1.is_empty() && v < 5 {
            warn!("the trailer has no usable /ID, using an empty one for key derivation");
        }

        let crypt_filters = if v >= 4 {
            CryptFilters::decode(document, encrypt)?
        } else {
            CryptFilters {
                named: Default::default(),
                stream_method: CryptMethod::Rc4,
                string_method: CryptMethod::Rc4,
                embedded_file_method: CryptMethod::Rc4,
            }
        };

        let mut state = EncryptionState {
            v,
            r,
            key_length,
            p,
            permissions: Permissions::from_p_value(p),
            o,
            u,
            oe,
            ue,
            perms,
            encrypt_metadata,
            id1,
            file_key: Vec::new(),
            crypt_filters,
            user_password_matched: false,
            owner_password_matched: false,
        };
        state.authenticate(password)?;
        Ok(state)
    }

    fn authenticate(&mut self, password: &str) -> Result<()> {
        if self.v >= 5 {
            let password = prepare_r6_password(password, self.r);
            if self.check_owner_password_v5(&password) {
                self.owner_password_matched = true;
                let key_salt = &self.o[40..48];
                let intermediate = hash_v5(self.r, &password, key_salt, &self.u[..48]);
                self.file_key = aes_cbc_no_pad(&intermediate, &[0; 16], &self.oe, false)?;
            } else if self.check_user_password_v5(&password) {
                self.user_password_matched = true;
                let key_salt = &self.u[40..48];
                let intermediate = hash_v5(self.r, &password, key_salt, b"");
                self.file_key = aes_cbc_no_pad(&intermediate, &[0; 16], &self.ue, false)?;
            } else {
                return Err(Error::InvalidPassword);
            }
            if !self.check_perms() {
                warn!("/Perms does not validate against /P and /EncryptMetadata");
            }
            Ok(())
        } else {
            if self.check_user_password_v4(password.as_bytes()) {
                self.user_password_matched = true;
                self.file_key = self.compute_encryption_key_from_password(password.as_bytes());
                return Ok(());
            }
            if let Some(recovered) = self.recover_user_password(password.as_bytes()) {
                self.owner_password_matched = true;
                self.file_key = self.compute_encryption_key_from_password(&recovered);
                return Ok(());
            }
            Err(Error::InvalidPassword)
        }
    }

    /// Re-check a candidate user password against the stored parameters.
    pub fn check_user_password(&self, password: &str) -> bool {
        if self.v >= 5 {
            self.check_user_password_v5(&prepare_r6_password(password, self.r))
        } else {
            self.check_user_password_v4(password.as_bytes())
        }
    }

    /// Re-check a candidate owner password.
    pub fn check_owner_password(&self, password: &str) -> bool {
        if self.v >= 5 {
            self.check_owner_password_v5(&prepare_r6_password(password, self.r))
        } else {
            self.recover_user_password(password.as_bytes()).is_some()
        }
    }

    // ---- V < 5: algorithms 3.2 through 3.7 ----

    /// Algorithm 3.2: the file key from the (padded) user password.
    fn compute_encryption_key_from_password(&self, password: &[u8]) -> Vec<u8> {
        let mut md5 = Md5::new();
        md5.update(pad_or_truncate(password));
        md5.update(&self.o[..32.min(self.o.len())]);
        md5.update(self.p.to_le_bytes());
        md5.update(&self.id1);
        if self.r >= 4 && !self.encrypt_metadata {
            md5.update([0xFF, 0xFF, 0xFF, 0xFF]);
        }
        iterate_md5(md5, if self.r >= 3 { 50 } else { 0 }, self.key_length)
    }

    /// The RC4 key protecting /O, from the owner password (falling back to
    /// the user password).
    fn compute_o_rc4_key(&self, user_password: &[u8], owner_password: &[u8]) -> Vec<u8> {
        let password = if owner_password.is_empty() {
            user_password
        } else {
            owner_password
        };
        let mut md5 = Md5::new();
        md5.update(pad_or_truncate(password));
        let mut key = iterate_md5(md5, if self.r >= 3 { 50 } else { 0 }, self.key_length);
        key.resize(self.key_length, 0);
        key
    }

    /// Algorithm 3.3: the /O value.
    fn compute_o_value(&self, user_password: &[u8], owner_password: &[u8]) -> Vec<u8> {
        let key = self.compute_o_rc4_key(user_password, owner_password);
        let mut data = pad_or_truncate(user_password).to_vec();
        iterate_rc4(&mut data, &key, if self.r >= 3 { 20 } else { 1 }, false);
        data
    }

    /// Algorithms 3.4/3.5: the /U value.
    fn compute_u_value(&self, user_password: &[u8]) -> Vec<u8> {
        let mut key = self.compute_encryption_key_from_password(user_password);
        key.resize(self.key_length, 0);
        if self.r < 3 {
            let mut data = PAD.to_vec();
            iterate_rc4(&mut data, &key, 1, false);
            data
        } else {
            let mut md5 = Md5::new();
            md5.update(PAD);
            md5.update(&self.id1);
            let mut data: Vec<u8> = md5.finalize().to_vec();
            iterate_rc4(&mut data, &key, 20, false);
            data.extend_from_slice(&U_PAD_R3);
            data
        }
    }

    /// Algorithm 3.6.
    fn check_user_password_v4(&self, password: &[u8]) -> bool {
        let computed = self.compute_u_value(password);
        let compare = if self.r >= 3 { 16 } else { 32 };
        self.u.len() >= compare && computed[..compare] == self.u[..compare]
    }

    /// Algorithm 3.7: decrypting /O with the owner key recovers the user
    /// password.
    fn recover_user_password(&self, owner_password: &[u8]) -> Option<Vec<u8>> {
        let key = self.compute_o_rc4_key(&[], owner_password);
        let mut candidate = self.o[..32.min(self.o.len())].to_vec();
        iterate_rc4(&mut candidate, &key, if self.r >= 3 { 20 } else { 1 }, true);
        if self.check_user_password_v4(&candidate) {
            Some(candidate)
        } else {
            None
        }
    }

    // ---- V = 5: algorithms 3.11, 3.12 and the 2.B hash ----

    fn check_user_password_v5(&self, password: &[u8]) -> bool {
        let user_data = &self.u[..32];
        let validation_salt = &self.u[32..40];
        hash_v5(self.r, password, validation_salt, b"") == user_data
    }

    fn check_owner_password_v5(&self, password: &[u8]) -> bool {
        let owner_data = &self.o[..32];
        let validation_salt = &self.o[32..40];
        hash_v5(self.r, password, validation_salt, &self.u[..48]) == owner_data
    }

    /// The clear 16-byte block that /Perms encrypts: P, the metadata flag,
    /// an "adb" marker, and four random bytes.
    fn perms_clear_block(&self) -> [u8; 16] {
        let mut block = *b"    \xff\xff\xff\xffTadb    ";
        block[..4].copy_from_slice(&self.p.to_le_bytes());
        if !self.encrypt_metadata {
            block[8] = b'F';
        }
        rand::rng().fill_bytes(&mut block[12..16]);
        block
    }

    /// Decrypt /Perms with the file key and check it against /P and
    /// /EncryptMetadata.
    pub fn check_perms(&self) -> bool {
        if self.file_key.len() != 32 || self.perms.len() < 16 {
            return false;
        }
        let mut block = [0u8; 16];
        block.copy_from_slice(&self.perms[..16]);
        let Ok(cipher) = ecb::Decryptor::<aes::Aes256>::new_from_slice(&self.file_key) else {
            return false;
        };
        let Ok(clear) = cipher.decrypt_padded_mut::<NoPadding>(&mut block) else {
            return false;
        };
        clear[..12] == self.perms_clear_block()[..12]
    }

    // ---- per-object keys and data transforms ----

    /// Algorithm 3.1/3.1a: the key used for one object's strings or
    /// streams.
    pub fn compute_object_key(&self, method: CryptMethod, id: ObjectId) -> Vec<u8> {
        if self.v >= 5 {
            // The file key is used directly; object identity is ignored.
            return self.file_key.clone();
        }
        let mut data = self.file_key.clone();
        data.push((id.0 & 0xFF) as u8);
        data.push(((id.0 >> 8) & 0xFF) as u8);
        data.push(((id.0 >> 16) & 0xFF) as u8);
        data.push((id.1 & 0xFF) as u8);
        data.push(((id.1 >> 8) & 0xFF) as u8);
        if method.is_aes() {
            data.extend_from_slice(b"sAlT");
        }
        let digest = Md5::digest(&data);
        let take = (self.key_length + 5).min(16);
        digest[..take].to_vec()
    }

    pub fn decrypt_string(&self, id: ObjectId, data: &[u8]) -> std::result::Result<Vec<u8>, DecryptionError> {
        let method = self.crypt_filters.string_method;
        self.apply_method(method, id, data, false, None)
    }

    pub fn encrypt_string(&self, id: ObjectId, data: &[u8], static_iv: Option<[u8; 16]>) -> std::result::Result<Vec<u8>, DecryptionError> {
        let method = self.crypt_filters.string_method;
        self.apply_method(method, id, data, true, static_iv)
    }

    pub fn decrypt_stream_data(
        &self,
        method: CryptMethod,
        id: ObjectId,
        data: &[u8],
    ) -> std::result::Result<Vec<u8>, DecryptionError> {
        self.apply_method(method, id, data, false, None)
    }

    pub fn encrypt_stream_data(
        &self,
        method: CryptMethod,
        id: ObjectId,
        data: &[u8],
        static_iv: Option<[u8; 16]>,
    ) -> std::result::Result<Vec<u8>, DecryptionError> {
        self.apply_method(method, id, data, true, static_iv)
    }

    fn apply_method(
        &self,
        method: CryptMethod,
        id: ObjectId,
        data: &[u8],
        encrypt: bool,
        static_iv: Option<[u8; 16]>,
    ) -> std::result::Result<Vec<u8>, DecryptionError> {
        match method {
            CryptMethod::None => Ok(data.to_vec()),
            CryptMethod::Rc4 => {
                let key = self.compute_object_key(method, id);
                Ok(rc4::rc4(&key, data))
            }
            CryptMethod::Aes128 | CryptMethod::Aes256 => {
                let key = self.compute_object_key(method, id);
                let iv = match static_iv {
                    Some(iv) => IvSource::Static(iv),
                    None => IvSource::Data,
                };
                let mut out = Vec::with_capacity(data.len() + 32);
                {
                    let mut link = if encrypt {
                        AesCbc::encrypt(&key, iv, true, &mut out)
                    } else {
                        AesCbc::decrypt(&key, IvSource::Data, true, &mut out)
                    }
                    .map_err(|_| DecryptionError::InvalidKeyLength)?;
                    link.write(data)
                        .and_then(|_| link.finish())
                        .map_err(|_| DecryptionError::InvalidCipherText("AES data is damaged"))?;
                }
                Ok(out)
            }
        }
    }

    /// Build the /Encrypt dictionary for writing.
    pub fn to_dictionary(&self) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.set("Filter", Object::Name(b"Standard".to_vec()));
        dict.set("V", self.v);
        dict.set("R", self.r);
        if self.v >= 2 {
            dict.set("Length", (self.key_length * 8) as i64);
        }
        dict.set("P", self.p as i32 as i64);
        dict.set("O", Object::String(self.o.clone(), crate::StringFormat::Hexadecimal));
        dict.set("U", Object::String(self.u.clone(), crate::StringFormat::Hexadecimal));
        if self.v >= 4 {
            let cfm = match self.crypt_filters.stream_method {
                CryptMethod::Aes256 => &b"AESV3"[..],
                CryptMethod::Aes128 => &b"AESV2"[..],
                CryptMethod::Rc4 => &b"V2"[..],
                CryptMethod::None => &b"None"[..],
            };
            let mut std_cf = Dictionary::new();
            std_cf.set("CFM", Object::Name(cfm.to_vec()));
            std_cf.set("AuthEvent", Object::Name(b"DocOpen".to_vec()));
            std_cf.set("Length", if self.v >= 5 { 32i64 } else { self.key_length as i64 });
            let mut cf = Dictionary::new();
            cf.set("StdCF", std_cf);
            dict.set("CF", cf);
            dict.set("StmF", Object::Name(b"StdCF".to_vec()));
            dict.set("StrF", Object::Name(b"StdCF".to_vec()));
            if !self.encrypt_metadata {
                dict.set("EncryptMetadata", false);
            }
        }
        if self.v >= 5 {
            dict.set("OE", Object::String(self.oe.clone(), crate::StringFormat::Hexadecimal));
            dict.set("UE", Object::String(self.ue.clone(), crate::StringFormat::Hexadecimal));
            dict.set(
                "Perms",
                Object::String(self.perms.clone(), crate::StringFormat::Hexadecimal),
            );
        }
        dict
    }
}

/// Parameters for preparing a document for encrypted output.
pub enum EncryptionVersion<'a> {
    /// RC4 with a 40-bit key (V1/R2).
    V1 {
        document: &'a Document,
        owner_password: &'a str,
        user_password: &'a str,
        permissions: Permissions,
    },
    /// RC4 with up to a 128-bit key (V2/R3).
    V2 {
        document: &'a Document,
        owner_password: &'a str,
        user_password: &'a str,
        /// Key length in bits, 40..=128.
        key_length: usize,
        permissions: Permissions,
    },
    /// Crypt filters with RC4 or AES-128 (V4/R4).
    V4 {
        document: &'a Document,
        encrypt_metadata: bool,
        method: CryptMethod,
        owner_password: &'a str,
        user_password: &'a str,
        permissions: Permissions,
    },
    /// AES-256 per PDF 2.0 (V5/R6).
    V5 {
        encrypt_metadata: bool,
        owner_password: &'a str,
        user_password: &'a str,
        permissions: Permissions,
    },
}

impl TryFrom<EncryptionVersion<'_>> for EncryptionState {
    type Error = Error;

    fn try_from(version: EncryptionVersion<'_>) -> Result<EncryptionState> {
        match version {
            EncryptionVersion::V1 {
                document,
                owner_password,
                user_password,
                permissions,
            } => new_state_v4(document, 1, 2, 5, CryptMethod::Rc4, true, owner_password, user_password, permissions),
            EncryptionVersion::V2 {
                document,
                owner_password,
                user_password,
                key_length,
                permissions,
            } => {
                if !(40..=128).contains(&key_length) || key_length % 8 != 0 {
                    return Err(DecryptionError::InvalidKeyLength.into());
                }
                new_state_v4(
                    document,
                    2,
                    3,
                    key_length / 8,
                    CryptMethod::Rc4,
                    true,
                    owner_password,
                    user_password,
                    permissions,
                )
            }
            EncryptionVersion::V4 {
                document,
                encrypt_metadata,
                method,
                owner_password,
                user_password,
                permissions,
            } => {
                if !matches!(method, CryptMethod::Rc4 | CryptMethod::Aes128) {
                    return Err(DecryptionError::InvalidCryptFilter.into());
                }
                new_state_v4(
                    document,
                    4,
                    4,
                    16,
                    method,
                    encrypt_metadata,
                    owner_password,
                    user_password,
                    permissions,
                )
            }
            EncryptionVersion::V5 {
                encrypt_metadata,
                owner_password,
                user_password,
                permissions,
            } => new_state_v5(encrypt_metadata, owner_password, user_password, permissions),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn new_state_v4(
    document: &Document,
    v: i64,
    r: i64,
    key_length: usize,
    method: CryptMethod,
    encrypt_metadata: bool,
    owner_password: &str,
    user_password: &str,
    permissions: Permissions,
) -> Result<EncryptionState> {
    let id1 = document
        .trailer
        .get(b"ID")
        .and_then(Object::as_array)
        .ok()
        .and_then(|id| id.first())
        .and_then(|first| first.as_string_bytes().ok())
        .map(<[u8]>::to_vec)
        .ok_or(DecryptionError::MissingFileId)?;

    let crypt_filters = CryptFilters {
        named: Default::default(),
        stream_method: method,
        string_method: method,
        embedded_file_method: method,
    };

    let mut state = EncryptionState {
        v,
        r,
        key_length,
        p: permissions.p_value(),
        permissions,
        o: Vec::new(),
        u: Vec::new(),
        oe: Vec::new(),
        ue: Vec::new(),
        perms: Vec::new(),
        encrypt_metadata,
        id1,
        file_key: Vec::new(),
        crypt_filters,
        user_password_matched: true,
        owner_password_matched: true,
    };
    state.o = state.compute_o_value(user_password.as_bytes(), owner_password.as_bytes());
    state.file_key = state.compute_encryption_key_from_password(user_password.as_bytes());
    state.u = state.compute_u_value(user_password.as_bytes());
    Ok(state)
}

fn new_state_v5(
    encrypt_metadata: bool,
    owner_password: &str,
    user_password: &str,
    permissions: Permissions,
) -> Result<EncryptionState> {
    let r = 6;
    let user_password = prepare_r6_password(user_password, r);
    let owner_password = prepare_r6_password(owner_password, r);

    let mut file_key = vec![0u8; 32];
    getrandom::fill(&mut file_key).map_err(|_| Error::Internal("the system random source failed"))?;

    let mut salts = [0u8; 32];
    rand::rng().fill_bytes(&mut salts);
    let (user_validation_salt, rest) = salts.split_at(8);
    let (user_key_salt, rest) = rest.split_at(8);
    let (owner_validation_salt, owner_key_salt) = rest.split_at(8);

    let mut u = hash_v5(r, &user_password, user_validation_salt, b"");
    u.extend_from_slice(user_validation_salt);
    u.extend_from_slice(user_key_salt);
    let user_intermediate = hash_v5(r, &user_password, user_key_salt, b"");
    let ue = aes_cbc_no_pad(&user_intermediate, &[0; 16], &file_key, true)?;

    let mut o = hash_v5(r, &owner_password, owner_validation_salt, &u[..48]);
    o.extend_from_slice(owner_validation_salt);
    o.extend_from_slice(owner_key_salt);
    let owner_intermediate = hash_v5(r, &owner_password, owner_key_salt, &u[..48]);
    let oe = aes_cbc_no_pad(&owner_intermediate, &[0; 16], &file_key, true)?;

    let mut state = EncryptionState {
        v: 5,
        r,
        key_length: 32,
        p: permissions.p_value(),
        permissions,
        o,
        u,
        oe,
        ue,
        perms: Vec::new(),
        encrypt_metadata,
        id1: Vec::new(),
        file_key,
        crypt_filters: CryptFilters {
            named: Default::default(),
            stream_method: CryptMethod::Aes256,
            string_method: CryptMethod::Aes256,
            embedded_file_method: CryptMethod::Aes256,
        },
        user_password_matched: true,
        owner_password_matched: true,
    };

    let mut perms_block = state.perms_clear_block();
    let cipher = ecb::Encryptor::<aes::Aes256>::new_from_slice(&state.file_key)
        .map_err(|_| DecryptionError::InvalidKeyLength)?;
    cipher
        .encrypt_padded_mut::<NoPadding>(&mut perms_block, 16)
        .map_err(|_| Error::Internal("ECB block processing failed"))?;
    state.perms = perms_block.to_vec();
    Ok(state)
}

/// Pad a password with the standard constant and truncate to 32 bytes.
pub(crate) fn pad_or_truncate(password: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let take = password.len().min(32);
    out[..take].copy_from_slice(&password[..take]);
    out[take..].copy_from_slice(&PAD[..32 - take]);
    out
}

/// SASLprep then UTF-8 truncation to 127 bytes, for R6 passwords.
fn prepare_r6_password(password: &str, r: i64) -> Vec<u8> {
    let prepared = if r >= 6 {
        match stringprep::saslprep(password) {
            Ok(prepared) => prepared.into_owned(),
            Err(_) => password.to_string(),
        }
    } else {
        password.to_string()
    };
    let mut bytes = prepared.into_bytes();
    if bytes.len() > 127 {
        let mut cut = 127;
        while cut > 0 && (bytes[cut] & 0xC0) == 0x80 {
            cut -= 1;
        }
        bytes.truncate(cut);
    }
    bytes
}

fn iterate_md5(md5: Md5, iterations: usize, key_length: usize) -> Vec<u8> {
    let mut digest: Vec<u8> = md5.finalize().to_vec();
    let take = key_length.min(16);
    for _ in 0..iterations {
        digest = Md5::digest(&digest[..take]).to_vec();
    }
    digest.truncate(take);
    digest
}

fn iterate_rc4(data: &mut Vec<u8>, key: &[u8], iterations: usize, reverse: bool) {
    let mut round_key = vec![0u8; key.len()];
    for i in 0..iterations {
        let xor = if reverse { iterations - 1 - i } else { i } as u8;
        for (slot, &byte) in round_key.iter_mut().zip(key.iter()) {
            *slot = byte ^ xor;
        }
        *data = rc4::rc4(&round_key, data);
    }
}

/// AES-CBC without padding, for key wrapping and the 2.B hash.
fn aes_cbc_no_pad(key: &[u8], iv: &[u8; 16], data: &[u8], encrypt: bool) -> Result<Vec<u8>> {
    if data.len() % 16 != 0 {
        return Err(DecryptionError::InvalidCipherText("data is not block aligned").into());
    }
    let mut buf = data.to_vec();
    let key = &key[..key.len().min(32)];
    let result: std::result::Result<(), ()> = match (key.len(), encrypt) {
        (16, true) => cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(|_| ())
            .and_then(|c| c.encrypt_padded_mut::<NoPadding>(&mut buf, data.len()).map(|_| ()).map_err(|_| ())),
        (16, false) => cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(|_| ())
            .and_then(|c| c.decrypt_padded_mut::<NoPadding>(&mut buf).map(|_| ()).map_err(|_| ())),
        (32, true) => cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(|_| ())
            .and_then(|c| c.encrypt_padded_mut::<NoPadding>(&mut buf, data.len()).map(|_| ()).map_err(|_| ())),
        (32, false) => cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(|_| ())
            .and_then(|c| c.decrypt_padded_mut::<NoPadding>(&mut buf).map(|_| ()).map_err(|_| ())),
        _ => Err(()),
    };
    result.map_err(|_| Error::from(DecryptionError::InvalidKeyLength))?;
    Ok(buf)
}

/// The hash of algorithm 2.B (ISO 32000-2). For R5 the initial SHA-256 is
/// the whole computation; R6 adds the AES/SHA iteration. The initial value
/// counts as round zero, which matches what shipping readers accept.
pub(crate) fn hash_v5(r: i64, password: &[u8], salt: &[u8], udata: &[u8]) -> Vec<u8> {
    let mut k: Vec<u8> = {
        let mut sha = Sha256::new();
        sha.update(password);
        sha.update(salt);
        sha.update(udata);
        sha.finalize().to_vec()
    };
    if r < 6 {
        return k;
    }
    let mut round: i64 = 0;
    loop {
        round += 1;
        let mut k1 = Vec::with_capacity((password.len() + k.len() + udata.len()) * 64);
        for _ in 0..64 {
            k1.extend_from_slice(password);
            k1.extend_from_slice(&k);
            k1.extend_from_slice(udata);
        }
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&k[16..32]);
        let e = aes_cbc_no_pad(&k[..16], &iv, &k1, true).expect("k1 is a multiple of 64 bytes");
        // Mod 3 of the first 16 bytes as a big-endian number equals the
        // byte sum mod 3, since 256 is 1 mod 3.
        let e_mod_3 = e[..16].iter().map(|&b| b as u32).sum::<u32>() % 3;
        k = match e_mod_3 {
            0 => Sha256::digest(&e).to_vec(),
            1 => Sha384::digest(&e).to_vec(),
            _ => Sha512::digest(&e).to_vec(),
        };
        if round >= 64 && (*e.last().expect("e is never empty") as i64) <= round - 32 {
            break;
        }
    }
    k.truncate(32);
    k
}

/// Decrypt strings and stream payloads in place. Cross-reference streams
/// are never encrypted; neither is the metadata stream when the metadata
/// flag is off. Stream payloads must already be materialized.
pub fn decrypt_object(
    state: &EncryptionState,
    id: ObjectId,
    object: &mut Object,
) -> std::result::Result<(), DecryptionError> {
    match object {
        Object::String(bytes, _) => {
            *bytes = state.decrypt_string(id, bytes)?;
        }
        Object::Array(items) => {
            for item in items {
                decrypt_object(state, id, item)?;
            }
        }
        Object::Dictionary(dict) => {
            for (_, value) in dict.iter_mut() {
                decrypt_object(state, id, value)?;
            }
        }
        Object::Stream(stream) => {
            if stream.dict.has_type(b"XRef") {
                return Ok(());
            }
            for (_, value) in stream.dict.iter_mut() {
                decrypt_object(state, id, value)?;
            }
            if stream.dict.has_type(b"Metadata") && !state.encrypt_metadata {
                return Ok(());
            }
            let method = state
                .crypt_filters
                .method_for_stream(&stream.dict, state.crypt_filters.stream_method);
            let data = match stream.data() {
                StreamData::Buffer(bytes) => bytes.clone(),
                _ => return Err(DecryptionError::InvalidCipherText("stream payload is not loaded")),
            };
            let decrypted = state.decrypt_stream_data(method, id, &data)?;
            stream.set_content(decrypted);
        }
        _ => {}
    }
    Ok(())
}
