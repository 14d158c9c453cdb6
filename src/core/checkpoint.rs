// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Binary checkpoints of a model configuration and its parameters.
//!
//! Layout, all numbers in little endian:
//!
//! ```text
//! b"PNET" | version: u32 | config length: u32 | config (JSON)
//! | nb params: u32 | nb params x (name length: u32 | name | rows: u32 | cols: u32 | f32 column major)
//! ```

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use log::info;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::core::config::RegressionConfig;
use crate::core::graph::PoseNet;
use crate::core::params::ParameterStore;
use crate::error::PoseNetError;
use crate::misc::type_aliases::Mat;

/// First bytes of every checkpoint.
pub const MAGIC: &[u8; 4] = b"PNET";

/// Current version of the format.
pub const VERSION: u32 = 1;

/// Write a configuration and parameters.
#[allow(clippy::cast_possible_truncation)]
pub fn write<W: Write>(
    writer: &mut W,
    config: &RegressionConfig,
    store: &ParameterStore,
) -> Result<(), PoseNetError> {
    writer.write_all(MAGIC)?;
    writer.write_u32::<LittleEndian>(VERSION)?;
    let json = serde_json::to_vec(config)?;
    writer.write_u32::<LittleEndian>(json.len() as u32)?;
    writer.write_all(&json)?;
    writer.write_u32::<LittleEndian>(store.len() as u32)?;
    for (name, value) in store.iter() {
        writer.write_u32::<LittleEndian>(name.len() as u32)?;
        writer.write_all(name.as_bytes())?;
        writer.write_u32::<LittleEndian>(value.nrows() as u32)?;
        writer.write_u32::<LittleEndian>(value.ncols() as u32)?;
        for x in value.iter() {
            writer.write_f32::<LittleEndian>(*x)?;
        }
    }
    Ok(())
}

/// Read a configuration and parameters written by `write`.
pub fn read<R: Read>(reader: &mut R) -> Result<(RegressionConfig, ParameterStore), PoseNetError> {
    let mut magic = [0; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(PoseNetError::Checkpoint("wrong magic number".to_string()));
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != VERSION {
        return Err(PoseNetError::Checkpoint(format!(
            "unsupported version {}",
            version
        )));
    }
    let json = read_bytes(reader)?;
    let config: RegressionConfig = serde_json::from_slice::<RegressionConfig>(&json)?.validate()?;

    let nb_params = reader.read_u32::<LittleEndian>()?;
    let mut store = ParameterStore::new();
    for _ in 0..nb_params {
        let name = String::from_utf8(read_bytes(reader)?)
            .map_err(|_| PoseNetError::Checkpoint("parameter name is not utf8".to_string()))?;
        let rows = reader.read_u32::<LittleEndian>()?;
        let cols = reader.read_u32::<LittleEndian>()?;
        let nb_bytes = u64::from(rows)
            .checked_mul(u64::from(cols))
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| PoseNetError::Checkpoint(format!("parameter {} is too large", name)))?;
        let data: Vec<f32> = read_exactly(reader, nb_bytes, &name)?
            .chunks(4)
            .map(LittleEndian::read_f32)
            .collect();
        let (rows, cols) = (rows as usize, cols as usize);
        if store
            .insert(&name, Mat::from_vec(rows, cols, data))
            .is_some()
        {
            return Err(PoseNetError::Checkpoint(format!(
                "duplicated parameter {}",
                name
            )));
        }
    }
    Ok((config, store))
}

fn read_bytes<R: Read>(reader: &mut R) -> Result<Vec<u8>, PoseNetError> {
    let len = reader.read_u32::<LittleEndian>()?;
    read_exactly(reader, u64::from(len), "name")
}

// Sizes come from the file, so the buffer only grows with the bytes actually read.
fn read_exactly<R: Read>(reader: &mut R, nb_bytes: u64, what: &str) -> Result<Vec<u8>, PoseNetError> {
    let mut bytes = Vec::new();
    reader.by_ref().take(nb_bytes).read_to_end(&mut bytes)?;
    if bytes.len() as u64 == nb_bytes {
        Ok(bytes)
    } else {
        Err(PoseNetError::Checkpoint(format!(
            "truncated {}: {} bytes out of {}",
            what,
            bytes.len(),
            nb_bytes
        )))
    }
}

/// Save the configuration and all parameters of a model into a file.
pub fn save<P: AsRef<Path>>(path: P, model: &PoseNet) -> Result<(), PoseNetError> {
    let mut writer = BufWriter::new(File::create(&path)?);
    let store = model.parameters().borrow();
    write(&mut writer, model.config(), &store)?;
    writer.flush()?;
    info!(
        "saved {} parameters to {}",
        store.len(),
        path.as_ref().display()
    );
    Ok(())
}

/// Load a checkpoint file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<(RegressionConfig, ParameterStore), PoseNetError> {
    let mut reader = BufReader::new(File::open(&path)?);
    let (config, store) = read(&mut reader)?;
    info!(
        "loaded {} parameters from {}",
        store.len(),
        path.as_ref().display()
    );
    Ok((config, store))
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use crate::core::backbone::{PointwiseBackbone, POINTWISE_ENDPOINT};
    use crate::core::config::{LossVariant, OrientationMode};
    use crate::core::graph::Testable;
    use crate::math::tensor::Tensor4;
    use crate::misc::type_aliases::Float;
    use std::io::Cursor;
    use std::rc::Rc;

    fn model() -> PoseNet {
        let config = RegressionConfig::new(
            POINTWISE_ENDPOINT,
            6,
            LossVariant::MinSymmetric,
            OrientationMode::Quaternion,
        )
        .unwrap();
        PoseNet::new(config, Rc::new(PointwiseBackbone::new(3, 6)), 4)
    }

    #[test]
    fn file_round_trip_preserves_predictions() {
        let net = model();
        let file = tempfile::NamedTempFile::new().unwrap();
        save(file.path(), &net).unwrap();
        let (config, store) = load(file.path()).unwrap();
        assert_eq!(net.config(), &config);
        assert_eq!(net.parameters().borrow().len(), store.len());

        let loaded = PoseNet::from_parameters(config, Rc::new(PointwiseBackbone::new(3, 6)), store);
        let images = Tensor4::from_fn(1, 3, 3, 3, |_, y, x, c| (y + x + c) as Float * 0.1);
        assert_eq!(
            Testable::new(&net).predict(&images).unwrap(),
            Testable::new(&loaded).predict(&images).unwrap()
        );
    }

    #[test]
    fn header_layout() {
        let mut buffer = Vec::new();
        write(&mut buffer, &RegressionConfig::default(), &ParameterStore::new()).unwrap();
        assert_eq!(b"PNET", &buffer[0..4]);
        assert_eq!(&[1, 0, 0, 0], &buffer[4..8]);
        assert_eq!(&[0, 0, 0, 0], &buffer[buffer.len() - 4..]);
    }

    #[test]
    fn parameters_are_column_major() {
        let mut store = ParameterStore::new();
        store.insert("a", Mat::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]));
        let mut buffer = Vec::new();
        write(&mut buffer, &RegressionConfig::default(), &store).unwrap();
        let tail = &buffer[buffer.len() - 16..];
        let mut values = [0.0; 4];
        Cursor::new(tail)
            .read_f32_into::<LittleEndian>(&mut values)
            .unwrap();
        assert_eq!([1.0, 3.0, 2.0, 4.0], values);
    }

    #[test]
    fn wrong_magic() {
        let mut cursor = Cursor::new(b"ONNX\x01\x00\x00\x00".to_vec());
        match read(&mut cursor) {
            Err(PoseNetError::Checkpoint(_)) => (),
            other => panic!("unexpected: {:?}", other.map(|(c, _)| c)),
        }
    }

    #[test]
    fn truncated_file() {
        let mut store = ParameterStore::new();
        store.insert("a", Mat::zeros(3, 3));
        let mut buffer = Vec::new();
        write(&mut buffer, &RegressionConfig::default(), &store).unwrap();
        buffer.truncate(buffer.len() - 1);
        match read(&mut Cursor::new(buffer)) {
            Err(PoseNetError::Checkpoint(_)) => (),
            other => panic!("unexpected: {:?}", other.map(|(c, _)| c)),
        }
    }

    fn header_with_one_parameter(rows: u32, cols: u32) -> Vec<u8> {
        let mut buffer = Vec::new();
        write(&mut buffer, &RegressionConfig::default(), &ParameterStore::new()).unwrap();
        buffer.truncate(buffer.len() - 4);
        buffer.write_u32::<LittleEndian>(1).unwrap();
        buffer.write_u32::<LittleEndian>(1).unwrap();
        buffer.push(b'a');
        buffer.write_u32::<LittleEndian>(rows).unwrap();
        buffer.write_u32::<LittleEndian>(cols).unwrap();
        buffer
    }

    #[test]
    fn oversized_dimensions() {
        let buffer = header_with_one_parameter(u32::max_value(), u32::max_value());
        match read(&mut Cursor::new(buffer)) {
            Err(PoseNetError::Checkpoint(_)) => (),
            other => panic!("unexpected: {:?}", other.map(|(c, _)| c)),
        }
    }

    #[test]
    fn dimensions_larger_than_file() {
        let mut buffer = header_with_one_parameter(1 << 20, 1 << 10);
        buffer.extend_from_slice(&[0; 16]);
        match read(&mut Cursor::new(buffer)) {
            Err(PoseNetError::Checkpoint(_)) => (),
            other => panic!("unexpected: {:?}", other.map(|(c, _)| c)),
        }
    }

    #[test]
    fn oversized_name_length() {
        let mut buffer = header_with_one_parameter(0, 0);
        let name_start = buffer.len() - 13;
        LittleEndian::write_u32(&mut buffer[name_start..name_start + 4], u32::max_value());
        match read(&mut Cursor::new(buffer)) {
            Err(PoseNetError::Checkpoint(_)) => (),
            other => panic!("unexpected: {:?}", other.map(|(c, _)| c)),
        }
    }
}
