//! Stream filter handling: applying and removing decode filters, predictor
//! support, and the caller-extensible filter registry.

use std::collections::HashMap;
use std::sync::Arc;

use flate2::Compression;
use log::warn;

use crate::pipeline::{
    A85Decode, A85Encode, FlateDecode, FlateEncode, HexDecode, HexEncode, LzwDecode, Pipeline, RunLengthDecode,
    RunLengthEncode,
};
use crate::{Dictionary, Document, Error, Result, Stream};

/// How aggressively stream filters may be removed on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DecodeLevel {
    /// Preserve all streams exactly.
    None,
    /// Remove only filters that round-trip losslessly on any data.
    Generalized,
    /// Also remove non-lossy specialized filters.
    Specialized,
    /// Remove everything decodable, lossy filters included.
    All,
}

impl Default for DecodeLevel {
    fn default() -> DecodeLevel {
        DecodeLevel::Generalized
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterClass {
    Generalized,
    Specialized,
    Lossy,
}

impl DecodeLevel {
    pub fn allows(self, class: FilterClass) -> bool {
        match self {
            DecodeLevel::None => false,
            DecodeLevel::Generalized => class == FilterClass::Generalized,
            DecodeLevel::Specialized => matches!(class, FilterClass::Generalized | FilterClass::Specialized),
            DecodeLevel::All => true,
        }
    }
}

/// Classification of the filters this library knows by name. `None` means
/// the filter is entirely unknown.
pub fn filter_class(name: &[u8]) -> Option<FilterClass> {
    match name {
        b"ASCIIHexDecode" | b"AHx" | b"ASCII85Decode" | b"A85" | b"LZWDecode" | b"LZW" | b"FlateDecode" | b"Fl" => {
            Some(FilterClass::Generalized)
        }
        b"RunLengthDecode" | b"RL" | b"CCITTFaxDecode" | b"CCF" | b"JBIG2Decode" | b"Crypt" => {
            Some(FilterClass::Specialized)
        }
        b"DCTDecode" | b"DCT" | b"JPXDecode" => Some(FilterClass::Lossy),
        _ => None,
    }
}

/// Whether this library can actually reverse the filter. Image codecs are
/// recognized but passed through.
pub fn is_decodable(name: &[u8]) -> bool {
    matches!(
        name,
        b"ASCIIHexDecode"
            | b"AHx"
            | b"ASCII85Decode"
            | b"A85"
            | b"LZWDecode"
            | b"LZW"
            | b"FlateDecode"
            | b"Fl"
            | b"RunLengthDecode"
            | b"RL"
    )
}

/// A caller-supplied stream filter. Registered filters take part in normal
/// decoding under the name they are registered with.
pub trait StreamFilter: Send + Sync {
    fn classification(&self) -> FilterClass;

    /// Inspect the stream's /DecodeParms. Returning false marks the stream
    /// as not decodable by this filter.
    fn accepts_parms(&self, parms: Option<&Dictionary>) -> bool;

    /// Build the decode pipeline in front of `next`.
    fn decode_pipeline<'a>(
        &self,
        parms: Option<&Dictionary>,
        next: Box<dyn Pipeline + 'a>,
    ) -> Result<Box<dyn Pipeline + 'a>>;
}

#[derive(Clone, Default)]
pub struct FilterRegistry {
    filters: HashMap<Vec<u8>, Arc<dyn StreamFilter>>,
}

impl FilterRegistry {
    pub fn new() -> FilterRegistry {
        FilterRegistry {
            filters: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<Vec<u8>>, filter: Arc<dyn StreamFilter>) {
        self.filters.insert(name.into(), filter);
    }

    pub fn get(&self, name: &[u8]) -> Option<&Arc<dyn StreamFilter>> {
        self.filters.get(name)
    }
}

impl Document {
    /// Register a named stream filter for this document.
    pub fn register_stream_filter(&mut self, name: impl Into<Vec<u8>>, filter: Arc<dyn StreamFilter>) {
        self.filter_registry.register(name, filter);
    }
}

fn predictor_wrap<'a>(parms: Option<&Dictionary>, next: Box<dyn Pipeline + 'a>) -> Box<dyn Pipeline + 'a> {
    let Some(parms) = parms else { return next };
    let predictor = parms
        .get_or_null(b"Predictor")
        .as_i64()
        .unwrap_or(1);
    if predictor < 2 {
        return next;
    }
    let colors = parms.get_or_null(b"Colors").as_i64().unwrap_or(1).max(1) as usize;
    let bits = parms.get_or_null(b"BitsPerComponent").as_i64().unwrap_or(8).max(1) as usize;
    let columns = parms.get_or_null(b"Columns").as_i64().unwrap_or(1).max(1) as usize;
    Box::new(PredictorDecode {
        next,
        predictor,
        colors,
        bits,
        columns,
        input: Vec::new(),
    })
}

fn early_change(parms: Option<&Dictionary>) -> bool {
    parms
        .map(|p| p.get_or_null(b"EarlyChange").as_i64().unwrap_or(1) != 0)
        .unwrap_or(true)
}

/// Build the decode pipeline for one filter in front of `next`. `None`
/// means the filter is not decodable here.
pub fn decode_pipeline_for<'a>(
    registry: &FilterRegistry,
    name: &[u8],
    parms: Option<&Dictionary>,
    next: Box<dyn Pipeline + 'a>,
) -> Result<Option<Box<dyn Pipeline + 'a>>> {
    if let Some(filter) = registry.get(name) {
        if !filter.accepts_parms(parms) {
            return Ok(None);
        }
        return filter.decode_pipeline(parms, next).map(Some);
    }
    let link: Box<dyn Pipeline + 'a> = match name {
        b"ASCIIHexDecode" | b"AHx" => Box::new(HexDecode::new(next)),
        b"ASCII85Decode" | b"A85" => Box::new(A85Decode::new(next)),
        b"FlateDecode" | b"Fl" => Box::new(FlateDecode::new(predictor_wrap(parms, next))),
        b"LZWDecode" | b"LZW" => Box::new(LzwDecode::new(predictor_wrap(parms, next), early_change(parms))),
        b"RunLengthDecode" | b"RL" => Box::new(RunLengthDecode::new(next)),
        _ => return Ok(None),
    };
    Ok(Some(link))
}

/// Apply the whole decode chain to `data`. The filters come outermost
/// first, the order they must be applied for decoding.
pub fn decode_data(
    registry: &FilterRegistry,
    filters: &[Vec<u8>],
    parms: &[Option<Dictionary>],
    data: &[u8],
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    {
        let mut chain: Box<dyn Pipeline + '_> = Box::new(&mut out);
        for (index, name) in filters.iter().enumerate().rev() {
            let filter_parms = parms.get(index).and_then(Option::as_ref);
            chain = decode_pipeline_for(registry, name, filter_parms, chain)?.ok_or_else(|| {
                Error::InvalidStream(format!(
                    "cannot decode filter /{}",
                    String::from_utf8_lossy(name)
                ))
            })?;
        }
        chain.write(data)?;
        chain.finish()?;
    }
    Ok(out)
}

/// Whether every filter in the stream's chain may be removed at `level`.
/// Unknown filters always force pass-through.
pub fn can_strip_filters(registry: &FilterRegistry, stream: &Stream, level: DecodeLevel) -> bool {
    let filters = stream.filters();
    if filters.is_empty() {
        return false;
    }
    let parms = stream.decode_parms();
    filters.iter().enumerate().all(|(index, name)| {
        let filter_parms = parms.get(index).and_then(Option::as_ref);
        if let Some(filter) = registry.get(name) {
            return level.allows(filter.classification()) && filter.accepts_parms(filter_parms);
        }
        match filter_class(name) {
            Some(class) => is_decodable(name) && level.allows(class),
            None => false,
        }
    })
}

/// Flate-compress with the default level.
pub fn flate_encode(data: &[u8]) -> Vec<u8> {
    flate_encode_level(data, Compression::default())
}

pub fn flate_encode_level(data: &[u8], level: Compression) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2 + 64);
    let mut link = FlateEncode::with_level(&mut out, level);
    link.write(data).expect("writing to a buffer cannot fail");
    link.finish().expect("writing to a buffer cannot fail");
    out
}

/// Encode `data` with one named filter, for tests and callers building
/// streams by hand. Flate is the only filter the writer adds on its own.
pub fn encode_data(name: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut chain: Box<dyn Pipeline + '_> = match name {
            b"FlateDecode" => Box::new(FlateEncode::new(&mut out)),
            b"ASCIIHexDecode" => Box::new(HexEncode::new(&mut out)),
            b"ASCII85Decode" => Box::new(A85Encode::new(&mut out)),
            b"RunLengthDecode" => Box::new(RunLengthEncode::new(&mut out)),
            _ => {
                return Err(Error::InvalidStream(format!(
                    "cannot encode filter /{}",
                    String::from_utf8_lossy(name)
                )));
            }
        };
        chain.write(data)?;
        chain.finish()?;
    }
    Ok(out)
}

impl Document {
    /// The decoded payload of a stream, with the whole filter chain
    /// applied. Fails when any filter is unknown or not decodable.
    pub fn get_stream_decoded(&self, stream: &Stream) -> Result<Vec<u8>> {
        let raw = self.raw_stream_bytes(stream)?;
        let filters = stream.filters();
        if filters.is_empty() {
            return Ok(raw);
        }
        decode_data(&self.filter_registry, &filters, &stream.decode_parms(), &raw)
    }

    /// Decode a stream in place, removing its filter entries. On failure
    /// the stream is left untouched and a warning is recorded.
    pub fn decompress_stream(&mut self, id: crate::ObjectId) -> Result<()> {
        let stream = self.get_object(id)?.as_stream()?.clone();
        match self.get_stream_decoded(&stream) {
            Ok(decoded) => {
                let target = self.get_object_mut(id)?.as_stream_mut()?;
                target.dict.remove(b"Filter");
                target.dict.remove(b"DecodeParms");
                target.set_content(decoded);
                Ok(())
            }
            Err(err) => {
                let message = format!("stream left compressed: {err}");
                self.warn(
                    crate::error::ErrorKind::DamagedPdf,
                    format!("object {} {}", id.0, id.1),
                    None,
                    message,
                )
            }
        }
    }
}

/// Undo a TIFF or PNG predictor. Buffers everything; rows are only whole at
/// finish anyway.
struct PredictorDecode<P> {
    next: P,
    predictor: i64,
    colors: usize,
    bits: usize,
    columns: usize,
    input: Vec<u8>,
}

impl<P: Pipeline> Pipeline for PredictorDecode<P> {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.input.extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let bytes_per_pixel = (self.colors * self.bits).div_ceil(8).max(1);
        let row_bytes = (self.columns * self.colors * self.bits).div_ceil(8);
        let out = if self.predictor == 2 {
            if self.bits != 8 {
                warn!("TIFF predictor with {} bits per component is passed through", self.bits);
                std::mem::take(&mut self.input)
            } else {
                let mut data = std::mem::take(&mut self.input);
                for row in data.chunks_mut(row_bytes.max(1)) {
                    for i in bytes_per_pixel..row.len() {
                        row[i] = row[i].wrapping_add(row[i - bytes_per_pixel]);
                    }
                }
                data
            }
        } else {
            png_unfilter(&self.input, row_bytes, bytes_per_pixel)?
        };
        self.next.write(&out)?;
        self.next.finish()
    }
}

fn png_unfilter(input: &[u8], row_bytes: usize, bytes_per_pixel: usize) -> Result<Vec<u8>> {
    let stride = row_bytes + 1;
    if stride == 1 {
        return Ok(Vec::new());
    }
    let mut out = Vec::with_capacity(input.len());
    let mut previous = vec![0u8; row_bytes];
    for chunk in input.chunks(stride) {
        if chunk.len() < 2 {
            break;
        }
        let filter_type = chunk[0];
        let mut row = chunk[1..].to_vec();
        row.resize(row_bytes, 0);
        match filter_type {
            0 => {}
            1 => {
                for i in bytes_per_pixel..row_bytes {
                    row[i] = row[i].wrapping_add(row[i - bytes_per_pixel]);
                }
            }
            2 => {
                for i in 0..row_bytes {
                    row[i] = row[i].wrapping_add(previous[i]);
                }
            }
            3 => {
                for i in 0..row_bytes {
                    let left = if i >= bytes_per_pixel { row[i - bytes_per_pixel] as u16 } else { 0 };
                    let up = previous[i] as u16;
                    row[i] = row[i].wrapping_add(((left + up) / 2) as u8);
                }
            }
            4 => {
                for i in 0..row_bytes {
                    let left = if i >= bytes_per_pixel { row[i - bytes_per_pixel] as i16 } else { 0 };
                    let up = previous[i] as i16;
                    let up_left = if i >= bytes_per_pixel {
                        previous[i - bytes_per_pixel] as i16
                    } else {
                        0
                    };
                    let p = left + up - up_left;
                    let pa = (p - left).abs();
                    let pb = (p - up).abs();
                    let pc = (p - up_left).abs();
                    let paeth = if pa <= pb && pa <= pc {
                        left
                    } else if pb <= pc {
                        up
                    } else {
                        up_left
                    };
                    row[i] = row[i].wrapping_add(paeth as u8);
                }
            }
            other => {
                return Err(Error::InvalidStream(format!("invalid PNG predictor row type {other}")));
            }
        }
        out.extend_from_slice(&row);
        previous = row;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary;

    #[test]
    fn decode_level_ordering() {
        assert!(!DecodeLevel::None.allows(FilterClass::Generalized));
        assert!(DecodeLevel::Generalized.allows(FilterClass::Generalized));
        assert!(!DecodeLevel::Generalized.allows(FilterClass::Specialized));
        assert!(DecodeLevel::Specialized.allows(FilterClass::Specialized));
        assert!(!DecodeLevel::Specialized.allows(FilterClass::Lossy));
        assert!(DecodeLevel::All.allows(FilterClass::Lossy));
    }

    #[test]
    fn flate_round_trip_through_decode_data() {
        let registry = FilterRegistry::new();
        let data = b"some stream payload, long enough to compress".repeat(10);
        let encoded = flate_encode(&data);
        let decoded = decode_data(&registry, &[b"FlateDecode".to_vec()], &[None], &encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn chained_filters_decode_in_order() {
        let registry = FilterRegistry::new();
        let data = b"chained filter payload".to_vec();
        let flated = flate_encode(&data);
        let hexed = encode_data(b"ASCIIHexDecode", &flated).unwrap();
        // Decoding applies ASCIIHexDecode first, then FlateDecode.
        let filters = vec![b"ASCIIHexDecode".to_vec(), b"FlateDecode".to_vec()];
        let decoded = decode_data(&registry, &filters, &[None, None], &hexed).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn unknown_filter_is_an_error_for_decode() {
        let registry = FilterRegistry::new();
        let err = decode_data(&registry, &[b"Mystery".to_vec()], &[None], b"x").unwrap_err();
        assert!(matches!(err, Error::InvalidStream(_)));
    }

    #[test]
    fn png_up_predictor_round_trip() {
        // Rows of 4 bytes, predictor type 2 (up) on each row.
        let plain: Vec<u8> = vec![10, 20, 30, 40, 11, 22, 33, 44];
        let mut filtered = Vec::new();
        let mut previous = [0u8; 4];
        for row in plain.chunks(4) {
            filtered.push(2);
            for (i, &b) in row.iter().enumerate() {
                filtered.push(b.wrapping_sub(previous[i]));
            }
            previous.copy_from_slice(row);
        }
        let decoded = png_unfilter(&filtered, 4, 1).unwrap();
        assert_eq!(decoded, plain);
    }

    #[test]
    fn strip_decision_honors_level_and_unknown_filters() {
        let registry = FilterRegistry::new();
        let flate = Stream::new(dictionary! { "Filter" => "FlateDecode" }, vec![]);
        assert!(can_strip_filters(&registry, &flate, DecodeLevel::Generalized));
        assert!(!can_strip_filters(&registry, &flate, DecodeLevel::None));

        let rle = Stream::new(dictionary! { "Filter" => "RunLengthDecode" }, vec![]);
        assert!(!can_strip_filters(&registry, &rle, DecodeLevel::Generalized));
        assert!(can_strip_filters(&registry, &rle, DecodeLevel::Specialized));

        let dct = Stream::new(dictionary! { "Filter" => "DCTDecode" }, vec![]);
        assert!(!can_strip_filters(&registry, &dct, DecodeLevel::All));

        let unknown = Stream::new(dictionary! { "Filter" => "Mystery" }, vec![]);
        assert!(!can_strip_filters(&registry, &unknown, DecodeLevel::All));
    }

    struct Doubler<'a> {
        next: Box<dyn Pipeline + 'a>,
    }

    impl Pipeline for Doubler<'_> {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            for &byte in data {
                self.next.write(&[byte, byte])?;
            }
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.next.finish()
        }
    }

    struct DoublingFilter;

    impl StreamFilter for DoublingFilter {
        fn classification(&self) -> FilterClass {
            FilterClass::Specialized
        }

        fn accepts_parms(&self, _parms: Option<&Dictionary>) -> bool {
            true
        }

        fn decode_pipeline<'a>(
            &self,
            _parms: Option<&Dictionary>,
            next: Box<dyn Pipeline + 'a>,
        ) -> Result<Box<dyn Pipeline + 'a>> {
            Ok(Box::new(Doubler { next }))
        }
    }

    #[test]
    fn registered_filter_participates_in_decoding() {
        let mut registry = FilterRegistry::new();
        registry.register("Doubling", Arc::new(DoublingFilter));
        let decoded = decode_data(&registry, &[b"Doubling".to_vec()], &[None], b"ab").unwrap();
        assert_eq!(decoded, b"aabb");
    }
}
