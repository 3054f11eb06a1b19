//! Weight Files
//!
//! A weight file is every parameter's values as little-endian `f64`,
//! concatenated in [`Parameters`] order, with no header. The reader must
//! already know the architecture; it is saved alongside as JSON
//! (`weights.bin` → `weights.json`). Transformers trained on normalised
//! telemetry also get the column ranges in `weights.norm.json`.
//!
//! Loading reads the whole file and checks its length against the model before
//! touching any weight, so a failed load leaves the model as it was.

use crate::error::{LoadError, Result};
use crate::tensor::Parameters;
use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const F64_BYTES: usize = std::mem::size_of::<f64>();

/// Encode all parameters as little-endian `f64` bytes
pub fn to_bytes<M: Parameters + ?Sized>(model: &M) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(model.num_scalars() * F64_BYTES);
    for p in model.parameters() {
        for &val in &p.value.data {
            bytes.extend_from_slice(&val.to_le_bytes());
        }
    }
    bytes
}

/// Overwrite all parameters from `bytes`
///
/// Fails without modifying the model unless `bytes` holds exactly one `f64`
/// per scalar parameter.
pub fn from_bytes<M: Parameters + ?Sized>(
    model: &mut M,
    bytes: &[u8],
) -> std::result::Result<(), LoadError> {
    let expected = model.num_scalars() * F64_BYTES;
    let found = bytes.len();
    if found < expected {
        return Err(LoadError::Truncated { expected, found });
    }
    if found > expected {
        return Err(LoadError::TrailingBytes { expected, found });
    }

    let mut chunks = bytes.chunks_exact(F64_BYTES);
    for p in model.parameters_mut() {
        for (val, chunk) in p.value.data.iter_mut().zip(chunks.by_ref()) {
            let mut buf = [0u8; F64_BYTES];
            buf.copy_from_slice(chunk);
            *val = f64::from_le_bytes(buf);
        }
    }
    Ok(())
}

pub fn save_weights<M: Parameters + ?Sized>(model: &M, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut file = BufWriter::new(File::create(path)?);
    file.write_all(&to_bytes(model))?;
    file.flush()?;
    info!(
        "saved {} parameters to {}",
        model.num_scalars(),
        path.display()
    );
    Ok(())
}

pub fn load_weights<M: Parameters + ?Sized>(
    model: &mut M,
    path: impl AsRef<Path>,
) -> std::result::Result<(), LoadError> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    from_bytes(model, &bytes)?;
    info!(
        "loaded {} parameters from {}",
        model.num_scalars(),
        path.display()
    );
    Ok(())
}

/// Sibling JSON path for a weight file
pub fn config_path(weights: impl AsRef<Path>) -> PathBuf {
    weights.as_ref().with_extension("json")
}

/// Sibling path for the telemetry ranges a model was trained on
pub fn normalization_path(weights: impl AsRef<Path>) -> PathBuf {
    weights.as_ref().with_extension("norm.json")
}

pub fn save_config<C: Serialize>(config: &C, path: impl AsRef<Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;
    Ok(())
}

pub fn load_config<C: DeserializeOwned>(path: impl AsRef<Path>) -> Result<C> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Config, FlightTransformer};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model(seed: u64) -> FlightTransformer {
        let mut rng = StdRng::seed_from_u64(seed);
        FlightTransformer::new(&Config::tiny(), &mut rng).unwrap()
    }

    fn values(m: &FlightTransformer) -> Vec<f64> {
        m.parameters()
            .iter()
            .flat_map(|p| p.value.data.clone())
            .collect()
    }

    #[test]
    fn test_bytes_roundtrip_is_bit_identical() {
        let a = model(1);
        let mut b = model(2);
        from_bytes(&mut b, &to_bytes(&a)).unwrap();

        let (va, vb) = (values(&a), values(&b));
        assert_eq!(va.len(), vb.len());
        for (x, y) in va.iter().zip(&vb) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn test_short_and_long_inputs_leave_model_untouched() {
        let source = to_bytes(&model(3));
        let mut target = model(4);
        let before = values(&target);

        let short = &source[..source.len() - 1];
        assert!(matches!(
            from_bytes(&mut target, short),
            Err(LoadError::Truncated { .. })
        ));

        let mut long = source.clone();
        long.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            from_bytes(&mut target, &long),
            Err(LoadError::TrailingBytes { .. })
        ));

        assert_eq!(values(&target), before);
    }

    #[test]
    fn test_config_path_swaps_extension() {
        assert_eq!(
            config_path("runs/policy.bin"),
            PathBuf::from("runs/policy.json")
        );
        assert_eq!(
            normalization_path("runs/flight.bin"),
            PathBuf::from("runs/flight.norm.json")
        );
    }
}
