//! Field level encoding of every message structure.
//!
//! Primitives are written with bincode in big-endian fixed-width form. Arrays whose length
//! is declared by a header field are written element by element without their own length
//! prefix. Fields introduced by later protocol versions are only present on the wire when
//! the version in force is high enough; see the `VERSION_*` constants.
use std::io::{Read, Write};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint, Limit},
    decode_from_std_read, encode_into_std_write,
};

use crate::{
    compress::{decompress, regular_run},
    data::{
        CLIENT_LOGIC_ERROR, ClientBlock, ClientFlags, Compression, DataBlock, DataObject,
        DataType, Dim, ErrorRecord, ErrorStack, ErrorType, NameValue, OpaqueType, PrivateFlags,
        Properties, PutDataBlock, RequestData, RequestKind, ServerBlock, Values, with_values,
    },
};

use super::{ProtocolError, structured::StructuredCodec};

/// Largest element count accepted for any array read from the wire.
pub const MAX_ELEMENTS: u64 = 1 << 28;
const MAX_VALUE_BYTES: usize = 16 * 1024 * 1024;

/// Unsigned, complex and 64-bit unsigned element types; opaque block fields.
pub const VERSION_UNSIGNED_TYPES: u32 = 3;
/// Private flags in the client block.
pub const VERSION_PRIVATE_FLAGS: u32 = 5;
/// Client flags and alternate rank; request source and delimiter.
pub const VERSION_CLIENT_FLAGS: u32 = 6;
/// OS name and DOI; request put flag.
pub const VERSION_OS_NAME: u32 = 7;
/// Batched request and data block lists; function name-values.
pub const VERSION_BATCH: u32 = 8;

pub(crate) type WireConfig = Configuration<BigEndian, Fixint, Limit<MAX_VALUE_BYTES>>;

pub(crate) fn wire_config() -> WireConfig {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
        .with_limit::<MAX_VALUE_BYTES>()
}

fn check_type(data_type: DataType, version: u32) -> Result<(), ProtocolError> {
    if data_type.supported_in(version) {
        Ok(())
    } else {
        Err(ProtocolError::UnsupportedTypeForVersion { data_type, version })
    }
}

fn reserve<T>(count: usize) -> Result<Vec<T>, ProtocolError> {
    let mut out = Vec::new();
    out.try_reserve_exact(count)
        .map_err(|_| ProtocolError::AllocationFailed(count))?;
    Ok(out)
}

fn check_len(what: &'static str, values: &Values, declared: usize) -> Result<(), ProtocolError> {
    if values.len() != declared {
        return Err(ProtocolError::LengthMismatch {
            what,
            declared,
            found: values.len(),
        });
    }
    Ok(())
}

pub(crate) struct Encoder<'a, W: Write> {
    out: &'a mut W,
    config: WireConfig,
    pub version: u32,
    structures: &'a dyn StructuredCodec,
}

impl<'a, W: Write> Encoder<'a, W> {
    pub fn new(
        out: &'a mut W,
        config: WireConfig,
        version: u32,
        structures: &'a dyn StructuredCodec,
    ) -> Self {
        Self {
            out,
            config,
            version,
            structures,
        }
    }

    pub fn put<T: Encode + ?Sized>(&mut self, value: &T) -> Result<(), ProtocolError> {
        encode_into_std_write(value, &mut *self.out, self.config)?;
        Ok(())
    }

    fn put_count(&mut self, count: usize) -> Result<(), ProtocolError> {
        self.put(&(count as u32))
    }

    fn put_type(&mut self, data_type: DataType) -> Result<(), ProtocolError> {
        self.put(&data_type.tag())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.out.write_all(bytes)?;
        Ok(())
    }

    pub fn put_values(&mut self, values: &Values) -> Result<(), ProtocolError> {
        check_type(values.data_type(), self.version)?;
        with_values!(values, v => {
            for x in v {
                self.put(x)?;
            }
        });
        Ok(())
    }

    fn put_structure(&mut self, opaque_type: OpaqueType, payload: &[u8]) -> Result<(), ProtocolError> {
        self.structures.send(&mut *self.out, opaque_type, payload)
    }
}

pub(crate) struct Decoder<'a, R: Read> {
    input: &'a mut R,
    config: WireConfig,
    pub version: u32,
    structures: &'a dyn StructuredCodec,
}

macro_rules! read_values {
    ($decoder:expr, $data_type:expr, $count:expr, { $($tag:ident => $t:ty),* $(,)? }) => {
        match $data_type {
            $(DataType::$tag => Values::$tag($decoder.get_vec::<$t>($count)?),)*
            other => return Err(ProtocolError::UnsupportedPayload(other)),
        }
    };
}

impl<'a, R: Read> Decoder<'a, R> {
    pub fn new(
        input: &'a mut R,
        config: WireConfig,
        version: u32,
        structures: &'a dyn StructuredCodec,
    ) -> Self {
        Self {
            input,
            config,
            version,
            structures,
        }
    }

    pub fn get<T: Decode<()>>(&mut self) -> Result<T, ProtocolError> {
        Ok(decode_from_std_read(&mut *self.input, self.config)?)
    }

    fn get_count(&mut self, what: &'static str) -> Result<usize, ProtocolError> {
        let count: u32 = self.get()?;
        if count as u64 > MAX_ELEMENTS {
            return Err(ProtocolError::AllocationTooLarge {
                what,
                count: count as u64,
                limit: MAX_ELEMENTS,
            });
        }
        Ok(count as usize)
    }

    fn get_type(&mut self) -> Result<DataType, ProtocolError> {
        let tag: i32 = self.get()?;
        DataType::from_tag(tag).ok_or(ProtocolError::UnknownTag {
            what: "data type",
            tag,
        })
    }

    fn get_checked_type(&mut self) -> Result<DataType, ProtocolError> {
        let data_type = self.get_type()?;
        check_type(data_type, self.version)?;
        Ok(data_type)
    }

    fn get_opaque_type(&mut self) -> Result<OpaqueType, ProtocolError> {
        let tag: i32 = self.get()?;
        OpaqueType::from_tag(tag).ok_or(ProtocolError::UnknownTag {
            what: "opaque type",
            tag,
        })
    }

    pub fn get_vec<T: Decode<()>>(&mut self, count: usize) -> Result<Vec<T>, ProtocolError> {
        let mut out = reserve(count)?;
        for _ in 0..count {
            out.push(self.get()?);
        }
        Ok(out)
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut out: Vec<u8> = reserve(count)?;
        out.resize(count, 0);
        self.input.read_exact(&mut out)?;
        Ok(out)
    }

    pub fn get_values(&mut self, data_type: DataType, count: usize) -> Result<Values, ProtocolError> {
        check_type(data_type, self.version)?;
        let values = read_values!(self, data_type, count, {
            Char => i8,
            Short => i16,
            Int => i32,
            UnsignedInt => u32,
            Long => i64,
            Float => f32,
            Double => f64,
            UnsignedChar => u8,
            UnsignedShort => u16,
            UnsignedLong => u64,
            Long64 => i64,
            UnsignedLong64 => u64,
            Complex => crate::data::Complex32,
            DComplex => crate::data::Complex64,
        });
        Ok(values)
    }

    fn get_structure(&mut self, opaque_type: OpaqueType) -> Result<Vec<u8>, ProtocolError> {
        self.structures.receive(&mut *self.input, opaque_type)
    }
}

/// Strings are carried as raw bytes.
fn get_payload<R: Read>(
    d: &mut Decoder<'_, R>,
    data_type: DataType,
    count: usize,
) -> Result<Values, ProtocolError> {
    if data_type == DataType::String {
        check_type(data_type, d.version)?;
        return Ok(Values::String(d.get_bytes(count)?));
    }
    d.get_values(data_type, count)
}

fn put_payload<W: Write>(e: &mut Encoder<'_, W>, values: &Values) -> Result<(), ProtocolError> {
    match values {
        Values::String(bytes) => {
            check_type(DataType::String, e.version)?;
            e.put_bytes(bytes)
        }
        other => e.put_values(other),
    }
}

/// A message structure with a version-aware wire form.
pub(crate) trait Wire: Sized {
    fn encode<W: Write>(&self, e: &mut Encoder<'_, W>) -> Result<(), ProtocolError>;
    fn decode<R: Read>(d: &mut Decoder<'_, R>) -> Result<Self, ProtocolError>;
}

impl Wire for ClientBlock {
    fn encode<W: Write>(&self, e: &mut Encoder<'_, W>) -> Result<(), ProtocolError> {
        let version = e.version.min(self.version);
        e.put(&self.version)?;
        e.put(&self.pid)?;
        e.put(&self.timeout)?;
        e.put(&self.uid)?;
        if version >= VERSION_CLIENT_FLAGS {
            e.put(&self.flags.bits())?;
            e.put(&self.alt_rank)?;
        } else {
            e.put(&0i32)?;
        }
        e.put(&self.properties.bits())?;
        if version >= VERSION_PRIVATE_FLAGS {
            e.put(&self.private_flags.bits())?;
        }
        if version >= VERSION_OS_NAME {
            e.put(self.os_name.as_str())?;
            e.put(self.doi.as_str())?;
        }
        Ok(())
    }

    fn decode<R: Read>(d: &mut Decoder<'_, R>) -> Result<Self, ProtocolError> {
        let mut block = ClientBlock {
            version: d.get()?,
            pid: d.get()?,
            timeout: d.get()?,
            uid: d.get()?,
            os_name: String::new(),
            ..ClientBlock::default()
        };
        let version = d.version.min(block.version);

        if version >= VERSION_CLIENT_FLAGS {
            block.flags = ClientFlags::from_bits(d.get()?);
            block.alt_rank = d.get()?;
        } else {
            let _legacy: i32 = d.get()?;
            block.flags = ClientFlags::empty();
        }
        block.properties = Properties::from_bits(d.get()?);
        if version >= VERSION_PRIVATE_FLAGS {
            block.private_flags = PrivateFlags::from_bits(d.get()?);
        }
        if version >= VERSION_OS_NAME {
            block.os_name = d.get()?;
            block.doi = d.get()?;
        }
        Ok(block)
    }
}

impl Wire for ErrorRecord {
    fn encode<W: Write>(&self, e: &mut Encoder<'_, W>) -> Result<(), ProtocolError> {
        e.put(&self.error_type.tag())?;
        e.put(&self.code)?;
        e.put(self.location.as_str())?;
        e.put(self.message.as_str())
    }

    fn decode<R: Read>(d: &mut Decoder<'_, R>) -> Result<Self, ProtocolError> {
        Ok(ErrorRecord {
            error_type: ErrorType::from_tag(d.get()?),
            code: d.get()?,
            location: d.get()?,
            message: d.get()?,
        })
    }
}

impl Wire for ServerBlock {
    fn encode<W: Write>(&self, e: &mut Encoder<'_, W>) -> Result<(), ProtocolError> {
        let version = e.version.min(self.version);
        e.put(&self.version)?;
        e.put(&self.error)?;
        e.put(self.msg.as_str())?;
        e.put_count(self.errors.len())?;
        if version >= VERSION_OS_NAME {
            e.put(self.os_name.as_str())?;
            e.put(self.doi.as_str())?;
        }
        for record in self.errors.records() {
            record.encode(e)?;
        }
        Ok(())
    }

    fn decode<R: Read>(d: &mut Decoder<'_, R>) -> Result<Self, ProtocolError> {
        let mut block = ServerBlock {
            version: d.get()?,
            error: d.get()?,
            msg: d.get()?,
            ..ServerBlock::default()
        };
        let version = d.version.min(block.version);
        let nerrors = d.get_count("error stack")?;
        if version >= VERSION_OS_NAME {
            block.os_name = d.get()?;
            block.doi = d.get()?;
        }
        let mut records = reserve(nerrors)?;
        for _ in 0..nerrors {
            records.push(ErrorRecord::decode(d)?);
        }
        block.errors = ErrorStack::from(records);
        Ok(block)
    }
}

impl Wire for RequestData {
    fn encode<W: Write>(&self, e: &mut Encoder<'_, W>) -> Result<(), ProtocolError> {
        e.put(&self.request.tag())?;
        e.put(&self.exp_number)?;
        e.put(&self.pass)?;
        for field in [
            &self.tpass,
            &self.archive,
            &self.device_name,
            &self.server,
            &self.path,
            &self.file,
            &self.format,
            &self.signal,
        ] {
            e.put(field.as_str())?;
        }
        if e.version >= VERSION_CLIENT_FLAGS {
            e.put(self.source.as_str())?;
            e.put(self.api_delim.as_str())?;
        }
        if e.version >= VERSION_OS_NAME {
            e.put(&self.put)?;
        }
        if e.version >= VERSION_BATCH {
            e.put(self.function.as_str())?;
            e.put_count(self.name_values.len())?;
            for nv in &self.name_values {
                e.put(nv.name.as_str())?;
                e.put(nv.value.as_str())?;
            }
        }
        Ok(())
    }

    fn decode<R: Read>(d: &mut Decoder<'_, R>) -> Result<Self, ProtocolError> {
        let mut request = RequestData {
            request: RequestKind::from_tag(d.get()?),
            exp_number: d.get()?,
            pass: d.get()?,
            tpass: d.get()?,
            archive: d.get()?,
            device_name: d.get()?,
            server: d.get()?,
            path: d.get()?,
            file: d.get()?,
            format: d.get()?,
            signal: d.get()?,
            ..RequestData::default()
        };
        if d.version >= VERSION_CLIENT_FLAGS {
            request.source = d.get()?;
            request.api_delim = d.get()?;
        }
        if d.version >= VERSION_OS_NAME {
            request.put = d.get()?;
        }
        if d.version >= VERSION_BATCH {
            request.function = d.get()?;
            let n = d.get_count("name-value list")?;
            let mut name_values = reserve(n)?;
            for _ in 0..n {
                name_values.push(NameValue {
                    name: d.get()?,
                    value: d.get()?,
                });
            }
            request.name_values = name_values;
        }
        Ok(request)
    }
}

/// Write a list whose count only travels on the wire from [`VERSION_BATCH`] on.
pub(crate) fn encode_list<T: Wire, W: Write>(
    e: &mut Encoder<'_, W>,
    what: &'static str,
    items: &[T],
) -> Result<(), ProtocolError> {
    if e.version >= VERSION_BATCH {
        e.put_count(items.len())?;
    } else if items.len() != 1 {
        return Err(ProtocolError::BatchNotSupported {
            what,
            count: items.len(),
            version: e.version,
        });
    }
    items.iter().try_for_each(|item| item.encode(e))
}

pub(crate) fn decode_list<T: Wire, R: Read>(
    d: &mut Decoder<'_, R>,
    what: &'static str,
) -> Result<Vec<T>, ProtocolError> {
    let count = if d.version >= VERSION_BATCH {
        d.get_count(what)?
    } else {
        1
    };
    let mut items = reserve(count)?;
    for _ in 0..count {
        items.push(T::decode(d)?);
    }
    Ok(items)
}

impl Wire for PutDataBlock {
    fn encode<W: Write>(&self, e: &mut Encoder<'_, W>) -> Result<(), ProtocolError> {
        check_type(self.data_type, e.version)?;
        e.put_type(self.data_type)?;
        e.put(&self.rank)?;
        e.put(&self.count)?;
        e.put(&self.opaque_type.tag())?;
        e.put(&self.opaque_count)?;
        e.put(self.block_name.as_str())?;

        if self.shape.len() != self.rank as usize && !self.shape.is_empty() {
            return Err(ProtocolError::LengthMismatch {
                what: "put block shape",
                declared: self.rank as usize,
                found: self.shape.len(),
            });
        }
        for i in 0..self.rank as usize {
            e.put(&self.shape.get(i).copied().unwrap_or(0))?;
        }

        if self.data_type == DataType::Compound {
            let payload = self.opaque.as_deref().unwrap_or_default();
            return e.put_structure(self.opaque_type, payload);
        }
        if self.count > 0 {
            let data = self.data.as_ref().ok_or(ProtocolError::LengthMismatch {
                what: "put block data",
                declared: self.count as usize,
                found: 0,
            })?;
            check_len("put block data", data, self.count as usize)?;
            put_payload(e, data)?;
        }
        Ok(())
    }

    fn decode<R: Read>(d: &mut Decoder<'_, R>) -> Result<Self, ProtocolError> {
        let mut block = PutDataBlock {
            data_type: d.get_checked_type()?,
            rank: d.get_count("put block rank")? as u32,
            count: d.get_count("put block data")? as u32,
            opaque_type: d.get_opaque_type()?,
            opaque_count: d.get()?,
            block_name: d.get()?,
            ..PutDataBlock::default()
        };
        block.shape = d.get_vec(block.rank as usize)?;

        if block.data_type == DataType::Compound {
            block.opaque = Some(d.get_structure(block.opaque_type)?);
        } else if block.count > 0 {
            block.data = Some(get_payload(d, block.data_type, block.count as usize)?);
        }
        Ok(block)
    }
}

impl Wire for Dim {
    fn encode<W: Write>(&self, e: &mut Encoder<'_, W>) -> Result<(), ProtocolError> {
        check_type(self.data_type, e.version)?;
        check_type(self.error_type, e.version)?;

        let compression = self.compression.clone().or_else(|| {
            self.values
                .as_ref()
                .and_then(regular_run)
                .map(|(dim0, diff)| Compression::Regular { dim0, diff })
        });
        let (dim0, diff) = match &compression {
            Some(Compression::Regular { dim0, diff }) => (*dim0, *diff),
            _ => (0.0, 0.0),
        };

        e.put_type(self.data_type)?;
        e.put_type(self.error_type)?;
        e.put(&self.error_model)?;
        e.put(&self.error_asymmetry)?;
        e.put_count(self.error_params.len())?;
        e.put(&self.dim_n)?;
        e.put(&compression.is_some())?;
        e.put(&dim0)?;
        e.put(&diff)?;
        e.put(&compression.as_ref().map_or(-1, Compression::method))?;
        e.put(&compression.as_ref().map_or(0, Compression::udoms))?;
        e.put(self.units.as_str())?;
        e.put(self.label.as_str())?;

        let same_type = |values: &Values| {
            if values.data_type() == self.data_type {
                Ok(())
            } else {
                Err(ProtocolError::Invalid(format!(
                    "{:?} domain array on a {:?} dimension",
                    values.data_type(),
                    self.data_type
                )))
            }
        };

        match &compression {
            Some(Compression::Regular { .. }) => {}
            Some(Compression::Domains { sams, offs, ints }) => {
                same_type(offs)?;
                same_type(ints)?;
                check_len("domain offsets", offs, sams.len())?;
                check_len("domain strides", ints, sams.len())?;
                sams.iter().try_for_each(|s| e.put(s))?;
                e.put_values(offs)?;
                e.put_values(ints)?;
            }
            Some(Compression::Offsets { offs }) => {
                same_type(offs)?;
                e.put_values(offs)?;
            }
            Some(Compression::Broadcast { offs, ints, .. }) => {
                same_type(offs)?;
                same_type(ints)?;
                check_len("broadcast offset", offs, 1)?;
                check_len("broadcast stride", ints, 1)?;
                e.put_values(offs)?;
                e.put_values(ints)?;
            }
            None if self.dim_n > 0 => {
                let values = self.values.as_ref().ok_or(ProtocolError::LengthMismatch {
                    what: "dimension",
                    declared: self.dim_n as usize,
                    found: 0,
                })?;
                check_len("dimension", values, self.dim_n as usize)?;
                put_payload(e, values)?;
            }
            None => {}
        }

        self.error_params.iter().try_for_each(|p| e.put(p))?;
        if self.error_type != DataType::Unknown {
            put_errors(e, "dimension error", &self.errhi, self.dim_n)?;
            if self.error_asymmetry {
                put_errors(e, "dimension low error", &self.errlo, self.dim_n)?;
            }
        }
        Ok(())
    }

    fn decode<R: Read>(d: &mut Decoder<'_, R>) -> Result<Self, ProtocolError> {
        let data_type = d.get_checked_type()?;
        let error_type = d.get_checked_type()?;
        let error_model = d.get()?;
        let error_asymmetry = d.get()?;
        let error_param_n = d.get_count("dimension error parameters")?;
        let dim_n = d.get_count("dimension")?;
        let compressed: bool = d.get()?;
        let dim0: f64 = d.get()?;
        let diff: f64 = d.get()?;
        let method: i32 = d.get()?;
        let udoms = d.get_count("dimension domains")?;

        let mut dim = Dim {
            data_type,
            dim_n: dim_n as u32,
            error_type,
            error_model,
            error_asymmetry,
            units: d.get()?,
            label: d.get()?,
            ..Dim::default()
        };

        if compressed {
            dim.compression = Some(match method {
                0 => Compression::Regular { dim0, diff },
                1 => Compression::Domains {
                    sams: d.get_vec(udoms)?,
                    offs: d.get_values(data_type, udoms)?,
                    ints: d.get_values(data_type, udoms)?,
                },
                2 => Compression::Offsets {
                    offs: d.get_values(data_type, udoms)?,
                },
                3 => Compression::Broadcast {
                    udoms: udoms as u32,
                    offs: d.get_values(data_type, 1)?,
                    ints: d.get_values(data_type, 1)?,
                },
                tag => {
                    return Err(ProtocolError::UnknownTag {
                        what: "compression method",
                        tag,
                    });
                }
            });
        } else if dim_n > 0 {
            dim.values = Some(get_payload(d, data_type, dim_n)?);
        }

        dim.error_params = d.get_vec(error_param_n)?;
        if error_type != DataType::Unknown {
            dim.errhi = Some(d.get_values(error_type, dim_n)?);
            if error_asymmetry {
                dim.errlo = Some(d.get_values(error_type, dim_n)?);
            }
        }
        Ok(dim)
    }
}

fn put_errors<W: Write>(
    e: &mut Encoder<'_, W>,
    what: &'static str,
    values: &Option<Values>,
    declared: u32,
) -> Result<(), ProtocolError> {
    let values = values.as_ref().ok_or(ProtocolError::LengthMismatch {
        what,
        declared: declared as usize,
        found: 0,
    })?;
    check_len(what, values, declared as usize)?;
    e.put_values(values)
}

impl Wire for DataBlock {
    fn encode<W: Write>(&self, e: &mut Encoder<'_, W>) -> Result<(), ProtocolError> {
        check_type(self.data_type, e.version)?;
        check_type(self.error_type, e.version)?;

        e.put(&self.data_n)?;
        e.put_count(self.dims.len())?;
        e.put(&self.order)?;
        e.put_type(self.data_type)?;
        e.put_type(self.error_type)?;
        e.put(&self.error_model)?;
        e.put(&self.error_asymmetry)?;
        e.put_count(self.error_params.len())?;
        e.put(&self.errcode)?;
        e.put(&self.source_status)?;
        e.put(&self.signal_status)?;
        e.put(self.data_units.as_str())?;
        e.put(self.data_label.as_str())?;
        e.put(self.data_desc.as_str())?;
        e.put(self.error_msg.as_str())?;
        if e.version >= VERSION_UNSIGNED_TYPES {
            e.put(&self.opaque_type.tag())?;
            e.put(&self.opaque_count)?;
        }

        if self.data_n == 0 {
            return Ok(());
        }

        if self.data_type != DataType::Compound {
            let data = self.data.as_ref().ok_or(ProtocolError::LengthMismatch {
                what: "data",
                declared: self.data_n as usize,
                found: 0,
            })?;
            check_len("data", data, self.data_n as usize)?;
            put_payload(e, data)?;
        }

        if self.has_errors_section() {
            self.error_params.iter().try_for_each(|p| e.put(p))?;
            if self.error_type != DataType::Unknown {
                put_errors(e, "data error", &self.errhi, self.data_n)?;
                if self.error_asymmetry {
                    put_errors(e, "data low error", &self.errlo, self.data_n)?;
                }
            }
        }

        self.dims.iter().try_for_each(|dim| dim.encode(e))
    }

    fn decode<R: Read>(d: &mut Decoder<'_, R>) -> Result<Self, ProtocolError> {
        let data_n = d.get_count("data")?;
        let rank = d.get_count("rank")?;
        let order = d.get()?;
        let data_type = d.get_checked_type()?;
        let error_type = d.get_checked_type()?;

        let mut block = DataBlock {
            data_n: data_n as u32,
            rank: rank as u32,
            order,
            data_type,
            error_type,
            error_model: d.get()?,
            error_asymmetry: d.get()?,
            ..DataBlock::default()
        };
        let error_param_n = d.get_count("error parameters")?;
        block.errcode = d.get()?;
        block.source_status = d.get()?;
        block.signal_status = d.get()?;
        block.data_units = d.get()?;
        block.data_label = d.get()?;
        block.data_desc = d.get()?;
        block.error_msg = d.get()?;
        if d.version >= VERSION_UNSIGNED_TYPES {
            block.opaque_type = d.get_opaque_type()?;
            block.opaque_count = d.get()?;
        }

        if data_n == 0 {
            return Ok(block);
        }

        if data_type != DataType::Compound {
            block.data = Some(get_payload(d, data_type, data_n)?);
        }

        if error_type != DataType::Unknown || error_param_n > 0 {
            block.error_params = d.get_vec(error_param_n)?;
            if error_type != DataType::Unknown {
                block.errhi = Some(d.get_values(error_type, data_n)?);
                if block.error_asymmetry {
                    block.errlo = Some(d.get_values(error_type, data_n)?);
                }
            }
        }

        let mut dims = reserve(rank)?;
        for _ in 0..rank {
            dims.push(Dim::decode(d)?);
        }

        // Every byte of the block has been read, so a failed expansion is recorded on the
        // block instead of failing the whole list.
        for (i, dim) in dims.iter_mut().enumerate() {
            if let Err(e) = decompress(dim) {
                block.errors.push(ErrorRecord::new(
                    ErrorType::Client,
                    CLIENT_LOGIC_ERROR,
                    "decompress",
                    format!("dimension {i}: {e}"),
                ));
                if block.errcode == 0 {
                    block.errcode = CLIENT_LOGIC_ERROR;
                }
            }
        }
        block.dims = dims;
        Ok(block)
    }
}

impl Wire for DataObject {
    fn encode<W: Write>(&self, e: &mut Encoder<'_, W>) -> Result<(), ProtocolError> {
        if self.md.len() > u16::MAX as usize {
            return Err(ProtocolError::Invalid(format!(
                "hash of {} bytes does not fit its length field",
                self.md.len()
            )));
        }
        e.put(&self.object_type)?;
        e.put(&(self.object.len() as u32))?;
        e.put(&self.hash_type)?;
        e.put(&(self.md.len() as u16))?;
        e.put_bytes(&self.object)?;
        e.put_bytes(&self.md)
    }

    fn decode<R: Read>(d: &mut Decoder<'_, R>) -> Result<Self, ProtocolError> {
        let object_type = d.get()?;
        let object_size = d.get_count("object")?;
        let hash_type = d.get()?;
        let hash_length: u16 = d.get()?;
        Ok(DataObject {
            object_type,
            hash_type,
            object: d.get_bytes(object_size)?,
            md: d.get_bytes(hash_length as usize)?,
        })
    }
}

pub(crate) fn encode_structure<W: Write>(
    e: &mut Encoder<'_, W>,
    opaque_type: OpaqueType,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    check_type(DataType::Compound, e.version)?;
    e.put(&opaque_type.tag())?;
    e.put_structure(opaque_type, payload)
}

pub(crate) fn decode_structure<R: Read>(
    d: &mut Decoder<'_, R>,
    expected: OpaqueType,
) -> Result<Vec<u8>, ProtocolError> {
    check_type(DataType::Compound, d.version)?;
    let opaque_type = d.get_opaque_type()?;
    if opaque_type != expected {
        return Err(ProtocolError::Invalid(format!(
            "expected a {expected:?} structure, received {opaque_type:?}"
        )));
    }
    d.get_structure(opaque_type)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::protocol::OpaquePassthrough;

    fn encode<T: Wire>(value: &T, version: u32) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        let mut e = Encoder::new(&mut out, wire_config(), version, &OpaquePassthrough);
        value.encode(&mut e)?;
        Ok(out)
    }

    fn decode<T: Wire>(bytes: Vec<u8>, version: u32) -> Result<T, ProtocolError> {
        let mut input = Cursor::new(bytes);
        let mut d = Decoder::new(&mut input, wire_config(), version, &OpaquePassthrough);
        T::decode(&mut d)
    }

    #[test]
    fn client_block_fields_gated_by_version() {
        let block = ClientBlock {
            version: 8,
            flags: ClientFlags::CACHE,
            alt_rank: 2,
            private_flags: PrivateFlags::EXTERNAL,
            os_name: "linux".to_string(),
            doi: "doi:1".to_string(),
            ..ClientBlock::default()
        };

        let full = decode::<ClientBlock>(encode(&block, 8).unwrap(), 8).unwrap();
        assert_eq!(full, block);

        let old = decode::<ClientBlock>(encode(&block, 5).unwrap(), 5).unwrap();
        assert_eq!(old.flags, ClientFlags::empty());
        assert_eq!(old.alt_rank, 0);
        assert_eq!(old.private_flags, PrivateFlags::EXTERNAL);
        assert!(old.os_name.is_empty());
        assert!(encode(&block, 5).unwrap().len() < encode(&block, 8).unwrap().len());
    }

    #[test]
    fn client_block_follows_its_own_version() {
        let block = ClientBlock {
            version: 5,
            os_name: "linux".to_string(),
            ..ClientBlock::default()
        };
        // A version 8 peer still reads this block with version 5 rules.
        let decoded = decode::<ClientBlock>(encode(&block, 8).unwrap(), 8).unwrap();
        assert_eq!(decoded.version, 5);
        assert!(decoded.os_name.is_empty());
    }

    #[test]
    fn server_block_carries_error_stack() {
        let mut block = ServerBlock::new(7);
        block.error = -3;
        block.msg = "failed".to_string();
        block.errors.push(ErrorRecord::new(ErrorType::Server, -3, "read", "no such signal"));

        let decoded = decode::<ServerBlock>(encode(&block, 8).unwrap(), 8).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn request_list_count_needs_batch_version() {
        let req = RequestData {
            signal: "ip".to_string(),
            source: "12345".to_string(),
            ..RequestData::default()
        };
        let mut out = Vec::new();
        let mut e = Encoder::new(&mut out, wire_config(), 7, &OpaquePassthrough);
        let err = encode_list(&mut e, "request", &[req.clone(), req.clone()]).unwrap_err();
        assert!(matches!(err, ProtocolError::BatchNotSupported { count: 2, .. }));

        let mut out = Vec::new();
        let mut e = Encoder::new(&mut out, wire_config(), 7, &OpaquePassthrough);
        encode_list(&mut e, "request", &[req.clone()]).unwrap();
        let mut input = Cursor::new(out);
        let mut d = Decoder::new(&mut input, wire_config(), 7, &OpaquePassthrough);
        let decoded: Vec<RequestData> = decode_list(&mut d, "request").unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].signal, "ip");
        assert_eq!(decoded[0].source, "12345");
    }

    #[test]
    fn data_block_with_compressed_axis_and_errors() {
        let mut block = DataBlock::new(Values::Float((0..10).map(|i| (i * i) as f32).collect()))
            .with_dim(Dim::new(Values::Double((0..10).map(|i| i as f64).collect())))
            .with_label("density", "m^-3");
        block.error_type = DataType::Float;
        block.error_asymmetry = true;
        block.errhi = Some(Values::Float(vec![0.5; 10]));
        block.errlo = Some(Values::Float(vec![0.25; 10]));

        let decoded = decode::<DataBlock>(encode(&block, 8).unwrap(), 8).unwrap();
        assert_eq!(decoded.data, block.data);
        assert_eq!(decoded.errlo, block.errlo);
        assert_eq!(decoded.data_label, "density");
        assert!(decoded.dims[0].is_compressed());
        assert_eq!(decoded.dims[0].values, block.dims[0].values);
        assert!(decoded.errors.is_empty());
    }

    #[test]
    fn large_long64_axis_survives_the_wire() {
        let axis: Vec<i64> = (0..10).map(|i| 1_700_000_000_000_000_001 + i).collect();
        let block = DataBlock::new(Values::Double(vec![0.0; 10]))
            .with_dim(Dim::new(Values::Long64(axis.clone())));

        let decoded = decode::<DataBlock>(encode(&block, 8).unwrap(), 8).unwrap();
        assert!(!decoded.dims[0].is_compressed());
        assert_eq!(decoded.dims[0].values, Some(Values::Long64(axis)));
        assert!(decoded.errors.is_empty());
    }

    #[test]
    fn element_type_checked_in_both_directions() {
        let block = DataBlock::new(Values::UnsignedShort(vec![1, 2, 3]));

        let err = encode(&block, 2).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnsupportedTypeForVersion {
                data_type: DataType::UnsignedShort,
                version: 2
            }
        ));

        let bytes = encode(&block, 8).unwrap();
        let err = decode::<DataBlock>(bytes, 2).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnsupportedTypeForVersion {
                data_type: DataType::UnsignedShort,
                version: 2
            }
        ));
    }

    #[test]
    fn oversized_counts_are_refused_before_allocation() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        let err = decode::<DataBlock>(bytes, 8).unwrap_err();
        assert!(matches!(err, ProtocolError::AllocationTooLarge { what: "data", .. }));
    }

    #[test]
    fn bad_domains_are_attached_to_the_block() {
        let block = DataBlock::new(Values::Int(vec![1, 2, 3])).with_dim(Dim::compressed(
            DataType::Int,
            3,
            Compression::Offsets {
                offs: Values::Int(vec![7, 8]),
            },
        ));
        let decoded = decode::<DataBlock>(encode(&block, 8).unwrap(), 8).unwrap();
        assert_eq!(decoded.errcode, CLIENT_LOGIC_ERROR);
        assert_eq!(decoded.errors.len(), 1);
        assert_eq!(decoded.dims[0].values, None);
    }

    #[test]
    fn put_block_with_structure() {
        let block = PutDataBlock::structured("tree", OpaqueType::Structures, b"payload".to_vec());
        let decoded = decode::<PutDataBlock>(encode(&block, 8).unwrap(), 8).unwrap();
        assert_eq!(decoded.opaque.as_deref(), Some(&b"payload"[..]));
        assert_eq!(decoded.block_name, "tree");

        let err = encode(&block, 3).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedTypeForVersion { .. }));
    }

    #[test]
    fn data_object_sizes_follow_metadata() {
        let object = DataObject {
            object_type: 2,
            hash_type: 1,
            md: vec![0xAB; 20],
            object: b"serialised".to_vec(),
        };
        let decoded = decode::<DataObject>(encode(&object, 8).unwrap(), 8).unwrap();
        assert_eq!(decoded, object);
    }
}
