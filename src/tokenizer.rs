//! Streaming PDF lexer. Bytes are presented one at a time; classification
//! works on raw bytes only and never goes through locale-dependent
//! character predicates.

/// ASCII whitespace per the PDF grammar, NUL included.
pub fn is_space(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | b'\r' | b'\x0B' | b'\x0C' | 0)
}

/// Whitespace or one of `( ) < > [ ] { } / %`.
pub fn is_delimiter(byte: u8) -> bool {
    is_space(byte)
        || matches!(
            byte,
            b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%'
        )
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Deepest allowed literal string nesting.
pub const MAX_STRING_DEPTH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Bad,
    ArrayOpen,
    ArrayClose,
    BraceOpen,
    BraceClose,
    DictOpen,
    DictClose,
    Integer,
    Real,
    String,
    Name,
    Word,
    Bool,
    Null,
    InlineImage,
    Space,
    Comment,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Processed form: string contents with escapes applied, name bytes
    /// after `#xx` decoding (without the slash), the lexeme for numbers and
    /// words, the payload for inline images.
    pub value: Vec<u8>,
    /// The bytes consumed from the input, terminator excluded.
    pub raw: Vec<u8>,
    pub error: Option<String>,
}

impl Token {
    pub fn is(&self, kind: TokenKind) -> bool {
        self.kind == kind
    }

    pub fn is_word(&self, word: &[u8]) -> bool {
        self.kind == TokenKind::Word && self.value == word
    }
}

/// A seekable window over the input being tokenized.
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> ByteCursor<'a> {
        ByteCursor { buf, pos: 0 }
    }

    pub fn at(buf: &'a [u8], pos: usize) -> ByteCursor<'a> {
        ByteCursor { buf, pos }
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.buf.len());
    }

    pub fn next_byte(&mut self) -> Option<u8> {
        let byte = self.buf.get(self.pos).copied();
        if byte.is_some() {
            self.pos += 1;
        }
        byte
    }

    pub fn back(&mut self, count: usize) {
        self.pos = self.pos.saturating_sub(count);
    }

    pub fn buffer(&self) -> &'a [u8] {
        self.buf
    }

    /// Position of `word` at a delimiter boundary, searching from `from`.
    /// A match flush at the start of the buffer does not count; real
    /// occurrences are always preceded by image data or whitespace.
    fn find_word_from(&self, from: usize, word: &[u8]) -> Option<usize> {
        let mut i = from.max(1);
        while i + word.len() <= self.buf.len() {
            if &self.buf[i..i + word.len()] == word
                && is_delimiter(self.buf[i - 1])
                && self
                    .buf
                    .get(i + word.len())
                    .copied()
                    .is_none_or(is_delimiter)
            {
                return Some(i);
            }
            i += 1;
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    BeforeToken,
    Top,
    InSpace,
    InComment,
    Lt,
    Gt,
    InString,
    StringEscape,
    StringAfterCr,
    CharCode,
    Name,
    NameHex1,
    NameHex2,
    Sign,
    Decimal,
    Number,
    Real,
    Literal,
    InHexString,
    InHexString2nd,
    InlineImage,
    TokenReady,
}

/// The streaming tokenizer. Feed it with [`present_character`] and
/// [`present_eof`], or drive it from a [`ByteCursor`] with [`next_token`].
///
/// [`present_character`]: Tokenizer::present_character
/// [`present_eof`]: Tokenizer::present_eof
/// [`next_token`]: Tokenizer::next_token
pub struct Tokenizer {
    state: State,
    kind: TokenKind,
    value: Vec<u8>,
    raw: Vec<u8>,
    error: Option<String>,
    in_token: bool,
    char_to_unread: Option<u8>,
    string_depth: usize,
    char_code: u16,
    digit_count: u8,
    hex_char: u8,
    inline_image_bytes: usize,
    bad: bool,
    allow_eof: bool,
    include_ignorable: bool,
}

impl Default for Tokenizer {
    fn default() -> Tokenizer {
        Tokenizer::new()
    }
}

impl Tokenizer {
    pub fn new() -> Tokenizer {
        Tokenizer {
            state: State::BeforeToken,
            kind: TokenKind::Bad,
            value: Vec::new(),
            raw: Vec::new(),
            error: None,
            in_token: false,
            char_to_unread: None,
            string_depth: 0,
            char_code: 0,
            digit_count: 0,
            hex_char: 0,
            inline_image_bytes: 0,
            bad: false,
            allow_eof: false,
            include_ignorable: false,
        }
    }

    /// EOF between tokens becomes an `Eof` token instead of `Bad`.
    pub fn allow_eof(&mut self) -> &mut Tokenizer {
        self.allow_eof = true;
        self
    }

    /// Surface whitespace and comments as tokens.
    pub fn include_ignorable(&mut self) -> &mut Tokenizer {
        self.include_ignorable = true;
        self
    }

    fn reset(&mut self) {
        self.state = State::BeforeToken;
        self.kind = TokenKind::Bad;
        self.value.clear();
        self.raw.clear();
        self.error = None;
        self.in_token = false;
        self.char_to_unread = None;
        self.string_depth = 0;
        self.char_code = 0;
        self.digit_count = 0;
        self.hex_char = 0;
        self.inline_image_bytes = 0;
        self.bad = false;
    }

    pub fn token_ready(&self) -> bool {
        self.state == State::TokenReady
    }

    fn take_token(&mut self) -> Token {
        debug_assert!(self.state == State::TokenReady);
        let token = Token {
            kind: self.kind,
            value: std::mem::take(&mut self.value),
            raw: std::mem::take(&mut self.raw),
            error: self.error.take(),
        };
        self.state = State::BeforeToken;
        self.kind = TokenKind::Bad;
        self.in_token = false;
        token
    }

    pub fn present_character(&mut self, ch: u8) {
        self.handle_character(ch);
        if self.in_token {
            self.raw.push(ch);
        }
    }

    fn handle_character(&mut self, ch: u8) {
        match self.state {
            State::BeforeToken => self.in_before_token(ch),
            State::Top => self.in_top(ch),
            State::InSpace => self.in_space_state(ch),
            State::InComment => self.in_comment(ch),
            State::Lt => self.in_lt(ch),
            State::Gt => self.in_gt(ch),
            State::InString => self.in_string(ch),
            State::StringEscape => self.in_string_escape(ch),
            State::StringAfterCr => self.in_string_after_cr(ch),
            State::CharCode => self.in_char_code(ch),
            State::Name => self.in_name(ch),
            State::NameHex1 => self.in_name_hex1(ch),
            State::NameHex2 => self.in_name_hex2(ch),
            State::Sign => self.in_sign(ch),
            State::Decimal => self.in_decimal(ch),
            State::Number => self.in_number(ch),
            State::Real => self.in_real(ch),
            State::Literal => self.in_literal(ch),
            State::InHexString => self.in_hexstring(ch),
            State::InHexString2nd => self.in_hexstring_2nd(ch),
            State::InlineImage => self.in_inline_image(ch),
            State::TokenReady => {
                unreachable!("tokenizer presented character while a token is waiting")
            }
        }
    }

    fn finish_token(&mut self, kind: TokenKind, unread: Option<u8>) {
        self.kind = kind;
        self.in_token = false;
        self.char_to_unread = unread;
        self.state = State::TokenReady;
    }

    fn in_before_token(&mut self, ch: u8) {
        if is_space(ch) {
            self.in_token = self.include_ignorable;
            if self.include_ignorable {
                self.state = State::InSpace;
            }
        } else if ch == b'%' {
            self.in_token = self.include_ignorable;
            self.state = State::InComment;
        } else {
            self.in_token = true;
            self.in_top(ch);
        }
    }

    fn in_top(&mut self, ch: u8) {
        match ch {
            b'(' => {
                self.string_depth = 1;
                self.state = State::InString;
            }
            b'<' => self.state = State::Lt,
            b'>' => self.state = State::Gt,
            b')' => {
                self.error = Some("unexpected )".to_string());
                self.kind = TokenKind::Bad;
                self.state = State::TokenReady;
            }
            b'[' => {
                self.kind = TokenKind::ArrayOpen;
                self.state = State::TokenReady;
            }
            b']' => {
                self.kind = TokenKind::ArrayClose;
                self.state = State::TokenReady;
            }
            b'{' => {
                self.kind = TokenKind::BraceOpen;
                self.state = State::TokenReady;
            }
            b'}' => {
                self.kind = TokenKind::BraceClose;
                self.state = State::TokenReady;
            }
            b'/' => self.state = State::Name,
            b'0'..=b'9' => {
                self.value.push(ch);
                self.state = State::Number;
            }
            b'+' | b'-' => {
                self.value.push(ch);
                self.state = State::Sign;
            }
            b'.' => {
                self.value.push(ch);
                self.state = State::Decimal;
            }
            _ => {
                self.value.push(ch);
                self.state = State::Literal;
            }
        }
    }

    fn in_space_state(&mut self, ch: u8) {
        // Only reachable with include_ignorable.
        if !is_space(ch) {
            self.finish_token(TokenKind::Space, Some(ch));
        }
    }

    fn in_comment(&mut self, ch: u8) {
        if ch == b'\r' || ch == b'\n' {
            if self.include_ignorable {
                self.finish_token(TokenKind::Comment, Some(ch));
            } else {
                self.state = State::BeforeToken;
            }
        } else if self.include_ignorable {
            self.value.push(ch);
        }
    }

    fn in_lt(&mut self, ch: u8) {
        if ch == b'<' {
            self.kind = TokenKind::DictOpen;
            self.state = State::TokenReady;
        } else {
            self.state = State::InHexString;
            self.in_hexstring(ch);
        }
    }

    fn in_gt(&mut self, ch: u8) {
        if ch == b'>' {
            self.kind = TokenKind::DictClose;
            self.state = State::TokenReady;
        } else {
            self.error = Some("unexpected >".to_string());
            self.finish_token(TokenKind::Bad, Some(ch));
        }
    }

    fn in_string(&mut self, ch: u8) {
        match ch {
            b'\\' => self.state = State::StringEscape,
            b'(' => {
                self.value.push(ch);
                self.string_depth += 1;
                if self.string_depth > MAX_STRING_DEPTH {
                    self.error = Some("string nesting exceeds the supported depth".to_string());
                    self.kind = TokenKind::Bad;
                    self.state = State::TokenReady;
                }
            }
            b')' => {
                self.string_depth -= 1;
                if self.string_depth == 0 {
                    self.kind = TokenKind::String;
                    self.state = State::TokenReady;
                } else {
                    self.value.push(ch);
                }
            }
            b'\r' => {
                // A bare CR inside a string reads as LF.
                self.value.push(b'\n');
                self.state = State::StringAfterCr;
            }
            _ => self.value.push(ch),
        }
    }

    fn in_string_escape(&mut self, ch: u8) {
        self.state = State::InString;
        match ch {
            b'0'..=b'7' => {
                self.state = State::CharCode;
                self.char_code = 0;
                self.digit_count = 0;
                self.in_char_code(ch);
            }
            b'n' => self.value.push(b'\n'),
            b'r' => self.value.push(b'\r'),
            b't' => self.value.push(b'\t'),
            b'b' => self.value.push(0x08),
            b'f' => self.value.push(0x0C),
            b'\n' => {}
            b'\r' => self.state = State::StringAfterCr,
            _ => self.value.push(ch),
        }
    }

    fn in_string_after_cr(&mut self, ch: u8) {
        self.state = State::InString;
        if ch != b'\n' {
            self.in_string(ch);
        }
    }

    fn in_char_code(&mut self, ch: u8) {
        if (b'0'..=b'7').contains(&ch) {
            self.char_code = 8 * self.char_code + (ch - b'0') as u16;
            self.digit_count += 1;
            if self.digit_count < 3 {
                return;
            }
            // High-order overflow is ignored.
            self.value.push((self.char_code % 256) as u8);
            self.state = State::InString;
        } else {
            self.value.push((self.char_code % 256) as u8);
            self.state = State::InString;
            self.in_string(ch);
        }
    }

    fn in_name(&mut self, ch: u8) {
        if is_delimiter(ch) {
            let kind = if self.bad { TokenKind::Bad } else { TokenKind::Name };
            self.finish_token(kind, Some(ch));
        } else if ch == b'#' {
            self.char_code = 0;
            self.state = State::NameHex1;
        } else {
            self.value.push(ch);
        }
    }

    fn in_name_hex1(&mut self, ch: u8) {
        self.hex_char = ch;
        if let Some(value) = hex_digit(ch) {
            self.char_code = (value as u16) << 4;
            self.state = State::NameHex2;
        } else {
            self.error = Some("name with stray # will not work with PDF >= 1.2".to_string());
            self.value.push(b'#');
            self.state = State::Name;
            self.in_name(ch);
        }
    }

    fn in_name_hex2(&mut self, ch: u8) {
        if let Some(value) = hex_digit(ch) {
            self.char_code |= value as u16;
        } else {
            self.error = Some("name with stray # will not work with PDF >= 1.2".to_string());
            self.value.push(b'#');
            self.value.push(self.hex_char);
            self.state = State::Name;
            self.in_name(ch);
            return;
        }
        if self.char_code == 0 {
            // The sentinel NUL is re-escaped as #00 when the name is
            // written back out.
            self.error = Some("null character not allowed in name token".to_string());
            self.value.push(0);
            self.bad = true;
            self.state = State::Name;
        } else {
            self.value.push(self.char_code as u8);
            self.state = State::Name;
        }
    }

    fn in_sign(&mut self, ch: u8) {
        if ch.is_ascii_digit() {
            self.value.push(ch);
            self.state = State::Number;
        } else if ch == b'.' {
            self.value.push(ch);
            self.state = State::Decimal;
        } else {
            self.state = State::Literal;
            self.in_literal(ch);
        }
    }

    fn in_decimal(&mut self, ch: u8) {
        if ch.is_ascii_digit() {
            self.value.push(ch);
            self.state = State::Real;
        } else {
            self.state = State::Literal;
            self.in_literal(ch);
        }
    }

    fn in_number(&mut self, ch: u8) {
        if ch.is_ascii_digit() {
            self.value.push(ch);
        } else if ch == b'.' {
            self.value.push(ch);
            self.state = State::Real;
        } else if is_delimiter(ch) {
            self.finish_token(TokenKind::Integer, Some(ch));
        } else {
            self.value.push(ch);
            self.state = State::Literal;
        }
    }

    fn in_real(&mut self, ch: u8) {
        if ch.is_ascii_digit() {
            self.value.push(ch);
        } else if is_delimiter(ch) {
            self.finish_token(TokenKind::Real, Some(ch));
        } else {
            self.value.push(ch);
            self.state = State::Literal;
        }
    }

    fn in_literal(&mut self, ch: u8) {
        if is_delimiter(ch) {
            let kind = match self.value.as_slice() {
                b"true" | b"false" => TokenKind::Bool,
                b"null" => TokenKind::Null,
                _ => TokenKind::Word,
            };
            self.finish_token(kind, Some(ch));
        } else {
            self.value.push(ch);
        }
    }

    fn in_hexstring(&mut self, ch: u8) {
        if let Some(value) = hex_digit(ch) {
            self.char_code = (value as u16) << 4;
            self.state = State::InHexString2nd;
        } else if ch == b'>' {
            self.kind = TokenKind::String;
            self.state = State::TokenReady;
        } else if is_space(ch) {
            // ignore
        } else {
            self.error = Some(format!("invalid character ({}) in hexstring", ch as char));
            self.kind = TokenKind::Bad;
            self.state = State::TokenReady;
        }
    }

    fn in_hexstring_2nd(&mut self, ch: u8) {
        if let Some(value) = hex_digit(ch) {
            self.value.push(self.char_code as u8 | value);
            self.state = State::InHexString;
        } else if ch == b'>' {
            // Odd digit count implies a trailing zero.
            self.value.push(self.char_code as u8);
            self.kind = TokenKind::String;
            self.state = State::TokenReady;
        } else if is_space(ch) {
            // ignore
        } else {
            self.error = Some(format!("invalid character ({}) in hexstring", ch as char));
            self.kind = TokenKind::Bad;
            self.state = State::TokenReady;
        }
    }

    fn in_inline_image(&mut self, _ch: u8) {
        if self.raw.len() + 1 == self.inline_image_bytes {
            self.kind = TokenKind::InlineImage;
            self.state = State::TokenReady;
        }
    }

    pub fn present_eof(&mut self) {
        match self.state {
            State::Name
            | State::NameHex1
            | State::NameHex2
            | State::Number
            | State::Real
            | State::Sign
            | State::Decimal
            | State::Literal => {
                // Push a delimiter through the machine to finish the token.
                self.present_character(0x0C);
                self.in_token = true;
            }
            State::Top | State::BeforeToken => {
                self.kind = if self.allow_eof {
                    TokenKind::Eof
                } else {
                    self.error = Some("EOF while reading token".to_string());
                    TokenKind::Bad
                };
            }
            State::InSpace => {
                self.kind = if self.include_ignorable {
                    TokenKind::Space
                } else if self.allow_eof {
                    TokenKind::Eof
                } else {
                    self.error = Some("EOF while reading token".to_string());
                    TokenKind::Bad
                };
            }
            State::InComment => {
                self.kind = if self.include_ignorable {
                    TokenKind::Comment
                } else {
                    self.error = Some("EOF while reading token".to_string());
                    TokenKind::Bad
                };
            }
            State::TokenReady => {}
            _ => {
                self.error = Some("EOF while reading token".to_string());
                self.kind = TokenKind::Bad;
            }
        }
        self.state = State::TokenReady;
    }

    /// Read one token from the cursor, leaving the terminator unconsumed.
    pub fn next_token(&mut self, input: &mut ByteCursor<'_>) -> Token {
        match self.state {
            // Armed by expect_inline_image: keep the prepared state.
            State::InlineImage | State::TokenReady => {}
            _ => self.reset(),
        }
        while self.state != State::TokenReady {
            match input.next_byte() {
                Some(ch) => {
                    self.present_character(ch);
                    if self.state == State::TokenReady && self.char_to_unread.take().is_some() {
                        input.back(1);
                    }
                }
                None => self.present_eof(),
            }
        }
        if self.kind == TokenKind::InlineImage {
            self.value = self.raw.clone();
        }
        self.take_token()
    }

    /// Arm the tokenizer to return the data between `ID` and the matching
    /// `EI` as one `InlineImage` token. The `EI` word itself is left in the
    /// input.
    pub fn expect_inline_image(&mut self, input: &mut ByteCursor<'_>) {
        if self.state == State::TokenReady {
            self.reset();
        }
        self.find_ei(input);
        self.in_token = true;
        if self.inline_image_bytes == 0 {
            self.kind = TokenKind::InlineImage;
            self.in_token = false;
            self.state = State::TokenReady;
        } else {
            self.state = State::InlineImage;
        }
    }

    /// Locate the terminating `EI`. This is a heuristic: a candidate `EI` at
    /// a delimiter boundary is accepted only when the next ten tokens look
    /// like plausible content (EOF, or words made of alphabetic characters
    /// and `*`, with no control bytes). A stricter rule would reject files
    /// that other readers accept. On failure the search continues from the
    /// rejected candidate; the last candidate wins if none passes.
    fn find_ei(&mut self, input: &mut ByteCursor<'_>) {
        let start = input.tell();
        let mut search_from = start;
        let mut okay = false;
        while !okay {
            let Some(ei) = input.find_word_from(search_from, b"EI") else {
                break;
            };
            self.inline_image_bytes = ei - start;
            input.seek(ei + 2);
            search_from = ei + 2;

            let mut check = Tokenizer::new();
            check.allow_eof();
            let mut found_bad = false;
            // Ten good tokens in a row (or EOF) mean we are looking at real
            // content rather than image bytes: any following inline image
            // needs at least that many tokens of setup before its own ID.
            for _ in 0..10 {
                let token = check.next_token(input);
                match token.kind {
                    TokenKind::Eof => okay = true,
                    TokenKind::Bad => found_bad = true,
                    TokenKind::Word => {
                        let mut found_alpha = false;
                        let mut found_non_printable = false;
                        let mut found_other = false;
                        for &ch in &token.value {
                            if ch.is_ascii_alphabetic() || ch == b'*' {
                                // '*' appears in valid operators.
                                found_alpha = true;
                            } else if ch >= 0x80 || (ch < 32 && !is_space(ch)) {
                                found_non_printable = true;
                                break;
                            } else {
                                found_other = true;
                            }
                        }
                        if found_non_printable || (found_alpha && found_other) {
                            found_bad = true;
                        }
                    }
                    _ => {}
                }
                if okay || found_bad {
                    break;
                }
            }
            if !found_bad {
                okay = true;
            }
        }
        input.seek(start);
    }
}
