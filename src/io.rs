//! Binary model serialization.
//!
//! Layout, all integers and floats big-endian:
//!
//! ```text
//! offset  size  field
//! 0       4     magic "LDM1"
//! 4       4     num_buckets  (i32)
//! 8       4     num_classes  (i32)
//! 12      ...   labels: per class, i16 length + UTF-8 bytes
//! ...     4C    scales[C]    (f32)
//! ...     4C    biases[C]    (f32)
//! ...     C*B   weights[C][B] (i8, class-major)
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::model::{LinearModel, Scorer};

pub const MODEL_MAGIC: [u8; 4] = *b"LDM1";

pub fn save_model<W: Write>(writer: &mut W, model: &LinearModel) -> Result<()> {
    writer.write_all(&MODEL_MAGIC)?;
    writer.write_i32::<BigEndian>(model.num_buckets() as i32)?;
    writer.write_i32::<BigEndian>(model.num_classes() as i32)?;
    for label in model.labels() {
        let bytes = label.as_bytes();
        if bytes.is_empty() || bytes.len() > i16::MAX as usize {
            return Err(Error::invalid_model(format!(
                "label {label:?} has unserializable length {}",
                bytes.len()
            )));
        }
        writer.write_i16::<BigEndian>(bytes.len() as i16)?;
        writer.write_all(bytes)?;
    }
    for &scale in model.scales() {
        writer.write_f32::<BigEndian>(scale)?;
    }
    for &bias in model.biases() {
        writer.write_f32::<BigEndian>(bias)?;
    }
    let raw: Vec<u8> = model.weights().iter().map(|&w| w as u8).collect();
    writer.write_all(&raw)?;
    Ok(())
}

pub fn load_model<R: Read>(reader: &mut R) -> Result<LinearModel> {
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|_| Error::invalid_model("truncated header"))?;
    if magic != MODEL_MAGIC {
        return Err(Error::invalid_model(format!(
            "bad magic {magic:02x?}, expected {MODEL_MAGIC:02x?}"
        )));
    }

    let num_buckets = reader.read_i32::<BigEndian>()?;
    if num_buckets <= 0 || !(num_buckets as u32).is_power_of_two() {
        return Err(Error::invalid_model(format!(
            "bucket count {num_buckets} is not a positive power of two"
        )));
    }
    let num_buckets = num_buckets as usize;

    let num_classes = reader.read_i32::<BigEndian>()?;
    if num_classes <= 0 {
        return Err(Error::invalid_model(format!(
            "class count {num_classes} is not positive"
        )));
    }
    let num_classes = num_classes as usize;

    let mut labels = Vec::with_capacity(num_classes);
    for idx in 0..num_classes {
        let len = reader.read_i16::<BigEndian>()?;
        if len <= 0 {
            return Err(Error::invalid_model(format!(
                "label {idx} has non-positive length {len}"
            )));
        }
        let mut bytes = vec![0u8; len as usize];
        reader
            .read_exact(&mut bytes)
            .map_err(|_| Error::invalid_model("truncated label block"))?;
        let label = String::from_utf8(bytes)
            .map_err(|_| Error::invalid_model(format!("label {idx} is not UTF-8")))?;
        labels.push(label);
    }

    let mut scales = vec![0f32; num_classes];
    reader.read_f32_into::<BigEndian>(&mut scales)?;
    for (idx, scale) in scales.iter().enumerate() {
        if !scale.is_finite() || *scale <= 0.0 {
            return Err(Error::invalid_model(format!(
                "scale {idx} is {scale}, expected a positive finite value"
            )));
        }
    }

    let mut biases = vec![0f32; num_classes];
    reader.read_f32_into::<BigEndian>(&mut biases)?;
    if biases.iter().any(|b| !b.is_finite()) {
        return Err(Error::invalid_model("non-finite bias"));
    }

    let mut raw = vec![0u8; num_classes * num_buckets];
    reader
        .read_exact(&mut raw)
        .map_err(|_| Error::invalid_model("truncated weight block"))?;
    let weights: Vec<i8> = raw.into_iter().map(|b| b as i8).collect();
    if weights.iter().any(|&w| w == i8::MIN) {
        return Err(Error::invalid_model("weight outside [-127, 127]"));
    }

    LinearModel::new(num_buckets, labels, scales, biases, weights)
}

pub fn write_model_file<P: AsRef<Path>>(path: P, model: &LinearModel) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    save_model(&mut writer, model)?;
    writer.flush()?;
    Ok(())
}

pub fn read_model_file<P: AsRef<Path>>(path: P) -> Result<LinearModel> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    load_model(&mut reader)
}
