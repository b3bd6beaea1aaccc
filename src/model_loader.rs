use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use safetensors::tensor::{Dtype, SafeTensorError, SafeTensors, TensorView};
use serde::{Deserialize, Serialize};

use crate::config::NetConfig;
use crate::error::{NetError, Result};
use crate::model::GrowingNetwork;
use crate::params::{Moments, ParameterStore};
use crate::tokenizer::CharVocab;
use crate::training::AdamOptimizer;

pub const FORMAT_TAG: &str = "growing-charnet/1";
pub const SAFETENSORS_EXTENSION: &str = "safetensors";
pub const LEGACY_EXTENSION: &str = "json";

/// On-disk encodings a snapshot can be read from or written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    SafeTensors,
    /// Older structured dump of the same fields, kept readable for migration.
    LegacyJson,
}

impl SnapshotFormat {
    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some(SAFETENSORS_EXTENSION) => Some(SnapshotFormat::SafeTensors),
            Some(LEGACY_EXTENSION) => Some(SnapshotFormat::LegacyJson),
            _ => None,
        }
    }

    /// A safetensors file starts with its little-endian header length followed
    /// by a JSON header; a legacy dump is a bare JSON object.
    pub fn sniff(bytes: &[u8]) -> Result<Self> {
        if let Some(prefix) = bytes.get(..8) {
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(prefix);
            let header_len = u64::from_le_bytes(len_bytes);
            if header_len <= (bytes.len() - 8) as u64 && bytes.get(8) == Some(&b'{') {
                return Ok(SnapshotFormat::SafeTensors);
            }
        }
        match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') => Ok(SnapshotFormat::LegacyJson),
            _ => Err(NetError::UnsupportedFormat(format!(
                "{} bytes with neither a safetensors nor a JSON header",
                bytes.len()
            ))),
        }
    }

    pub fn detect(path: &Path, bytes: &[u8]) -> Result<Self> {
        match Self::from_extension(path) {
            Some(format) => Ok(format),
            None => Self::sniff(bytes),
        }
    }
}

/// Everything a network persists, independent of encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSnapshot {
    pub vocab: Vec<char>,
    pub hidden_size: usize,
    pub params: ParameterStore,
    pub step: u64,
    pub interactions: u64,
    pub characters_total: u64,
    pub learning_rate: Option<f32>,
}

impl GrowingNetwork {
    pub fn snapshot(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            vocab: self.vocab.chars().to_vec(),
            hidden_size: self.params.hidden_size(),
            params: self.params.clone(),
            step: self.step,
            interactions: self.interactions,
            characters_total: self.characters_total,
            learning_rate: Some(self.optimizer.learning_rate),
        }
    }

    /// Rebuilds a network from a decoded snapshot, rejecting inconsistent shapes.
    pub fn from_snapshot(snapshot: NetworkSnapshot, config: &NetConfig) -> Result<Self> {
        let vocab = CharVocab::new(snapshot.vocab.iter().copied());
        if vocab.len() != snapshot.vocab.len() {
            return Err(NetError::CorruptSnapshot(
                "vocabulary contains duplicate characters".to_string(),
            ));
        }
        if vocab.len() != snapshot.params.vocab_size() {
            return Err(NetError::CorruptSnapshot(format!(
                "vocabulary has {} characters but w_embed has {} rows",
                vocab.len(),
                snapshot.params.vocab_size()
            )));
        }
        if snapshot.hidden_size != snapshot.params.hidden_size() {
            return Err(NetError::CorruptSnapshot(format!(
                "hidden size {} disagrees with w_embed width {}",
                snapshot.hidden_size,
                snapshot.params.hidden_size()
            )));
        }
        if let Some(problem) = snapshot.params.shape_mismatch() {
            return Err(NetError::CorruptSnapshot(problem));
        }

        let mut optimizer = AdamOptimizer::from_config(config);
        if let Some(lr) = snapshot.learning_rate {
            optimizer.learning_rate = lr;
        }
        Ok(Self {
            vocab,
            params: snapshot.params,
            optimizer,
            step: snapshot.step,
            interactions: snapshot.interactions,
            characters_total: snapshot.characters_total,
            rng: StdRng::from_entropy(),
            growth_hook: None,
        })
    }

    /// Writes a snapshot, choosing the encoding from the extension
    /// (safetensors unless the path ends in `.json`).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let format = SnapshotFormat::from_extension(path).unwrap_or(SnapshotFormat::SafeTensors);
        self.save_as(path, format)
    }

    pub fn save_as<P: AsRef<Path>>(&self, path: P, format: SnapshotFormat) -> Result<()> {
        write_snapshot(path.as_ref(), &self.snapshot(), format)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_with_config(path, &NetConfig::default())
    }

    pub fn load_with_config<P: AsRef<Path>>(path: P, config: &NetConfig) -> Result<Self> {
        let snapshot = read_snapshot(path.as_ref())?;
        Self::from_snapshot(snapshot, config)
    }
}

pub fn read_snapshot(path: &Path) -> Result<NetworkSnapshot> {
    let bytes = fs::read(path)?;
    let format = SnapshotFormat::detect(path, &bytes)?;
    debug!("reading {:?} snapshot from {}", format, path.display());
    match format {
        SnapshotFormat::SafeTensors => decode_safetensors(&bytes),
        SnapshotFormat::LegacyJson => decode_legacy_json(&bytes),
    }
}

/// Encodes and writes through a sibling temp file so an interrupted save
/// never leaves a truncated snapshot behind.
pub fn write_snapshot(path: &Path, snapshot: &NetworkSnapshot, format: SnapshotFormat) -> Result<()> {
    let bytes = match format {
        SnapshotFormat::SafeTensors => encode_safetensors(snapshot)?,
        SnapshotFormat::LegacyJson => encode_legacy_json(snapshot)?,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    fs::write(&tmp_path, &bytes)?;
    fs::rename(&tmp_path, path)?;
    debug!("wrote {} bytes ({:?}) to {}", bytes.len(), format, path.display());
    Ok(())
}

/// Where the legacy dump for `path` would live.
pub fn legacy_path(path: &Path) -> PathBuf {
    path.with_extension(LEGACY_EXTENSION)
}

/// Loads `path` if it exists. Otherwise, if a legacy dump sits next to it,
/// loads that and immediately re-saves it as safetensors at `path`.
/// Returns `Ok(None)` when neither exists.
pub fn load_with_migration<P: AsRef<Path>>(path: P, config: &NetConfig) -> Result<Option<GrowingNetwork>> {
    let path = path.as_ref();
    if path.exists() {
        return GrowingNetwork::load_with_config(path, config).map(Some);
    }
    let legacy = legacy_path(path);
    if legacy != path && legacy.exists() {
        let net = GrowingNetwork::load_with_config(&legacy, config)?;
        net.save_as(path, SnapshotFormat::SafeTensors)?;
        info!(
            "migrated legacy snapshot {} to {}",
            legacy.display(),
            path.display()
        );
        return Ok(Some(net));
    }
    Ok(None)
}

fn named_tensors(params: &ParameterStore) -> Vec<(&'static str, &Array2<f32>)> {
    vec![
        ("w_embed", &params.w_embed),
        ("w_out", &params.w_out),
        ("b_hidden", &params.b_hidden),
        ("b_out", &params.b_out),
        ("m_w_embed", &params.adam_w_embed.m),
        ("v_w_embed", &params.adam_w_embed.v),
        ("m_w_out", &params.adam_w_out.m),
        ("v_w_out", &params.adam_w_out.v),
        ("m_b_hidden", &params.adam_b_hidden.m),
        ("v_b_hidden", &params.adam_b_hidden.v),
        ("m_b_out", &params.adam_b_out.m),
        ("v_b_out", &params.adam_b_out.v),
    ]
}

pub fn encode_safetensors(snapshot: &NetworkSnapshot) -> Result<Vec<u8>> {
    let buffers: Vec<(&str, Vec<usize>, Vec<u8>)> = named_tensors(&snapshot.params)
        .into_iter()
        .map(|(name, array)| {
            let values: Vec<f32> = array.iter().copied().collect();
            let bytes = bytemuck::cast_slice::<f32, u8>(&values).to_vec();
            (name, array.shape().to_vec(), bytes)
        })
        .collect();

    let mut views = Vec::with_capacity(buffers.len());
    for (name, shape, bytes) in &buffers {
        views.push((name.to_string(), TensorView::new(Dtype::F32, shape.clone(), bytes)?));
    }

    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), FORMAT_TAG.to_string());
    metadata.insert("vocab".to_string(), serde_json::to_string(&snapshot.vocab)?);
    metadata.insert("hidden_size".to_string(), snapshot.hidden_size.to_string());
    metadata.insert("t".to_string(), snapshot.step.to_string());
    metadata.insert("interactions".to_string(), snapshot.interactions.to_string());
    metadata.insert("characters_total".to_string(), snapshot.characters_total.to_string());
    if let Some(lr) = snapshot.learning_rate {
        metadata.insert("learning_rate".to_string(), lr.to_string());
    }

    Ok(safetensors::tensor::serialize(views, &Some(metadata))?)
}

pub fn decode_safetensors(bytes: &[u8]) -> Result<NetworkSnapshot> {
    let (_, header) = SafeTensors::read_metadata(bytes)?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let tensors = SafeTensors::deserialize(bytes)?;

    let vocab_json = metadata
        .get("vocab")
        .ok_or_else(|| NetError::CorruptSnapshot("missing vocab metadata".to_string()))?;
    let vocab: Vec<char> = serde_json::from_str(vocab_json)?;

    let w_embed = required_tensor(&tensors, "w_embed")?;
    let w_out = required_tensor(&tensors, "w_out")?;
    let b_hidden = required_tensor(&tensors, "b_hidden")?;
    let b_out = required_tensor(&tensors, "b_out")?;
    let hidden_size = match metadata.get("hidden_size") {
        Some(raw) => parse_number(raw, "hidden_size")?,
        None => w_embed.ncols(),
    };

    let params = ParameterStore {
        adam_w_embed: moments_or_zeros(
            optional_tensor(&tensors, "m_w_embed")?,
            optional_tensor(&tensors, "v_w_embed")?,
            w_embed.dim(),
        ),
        adam_w_out: moments_or_zeros(
            optional_tensor(&tensors, "m_w_out")?,
            optional_tensor(&tensors, "v_w_out")?,
            w_out.dim(),
        ),
        adam_b_hidden: moments_or_zeros(
            optional_tensor(&tensors, "m_b_hidden")?,
            optional_tensor(&tensors, "v_b_hidden")?,
            b_hidden.dim(),
        ),
        adam_b_out: moments_or_zeros(
            optional_tensor(&tensors, "m_b_out")?,
            optional_tensor(&tensors, "v_b_out")?,
            b_out.dim(),
        ),
        w_embed,
        w_out,
        b_hidden,
        b_out,
    };

    Ok(NetworkSnapshot {
        vocab,
        hidden_size,
        params,
        step: counter(&metadata, "t")?,
        interactions: counter(&metadata, "interactions")?,
        characters_total: counter(&metadata, "characters_total")?,
        learning_rate: metadata
            .get("learning_rate")
            .map(|raw| parse_number::<f32>(raw, "learning_rate"))
            .transpose()?,
    })
}

fn required_tensor(tensors: &SafeTensors<'_>, name: &str) -> Result<Array2<f32>> {
    optional_tensor(tensors, name)?
        .ok_or_else(|| NetError::CorruptSnapshot(format!("missing tensor '{}'", name)))
}

fn optional_tensor(tensors: &SafeTensors<'_>, name: &str) -> Result<Option<Array2<f32>>> {
    let view = match tensors.tensor(name) {
        Ok(view) => view,
        Err(SafeTensorError::TensorNotFound(_)) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if view.dtype() != Dtype::F32 {
        return Err(NetError::CorruptSnapshot(format!(
            "tensor '{}' has dtype {:?}, only F32 is supported",
            name,
            view.dtype()
        )));
    }
    let (rows, cols) = match view.shape() {
        [rows, cols] => (*rows, *cols),
        other => {
            return Err(NetError::CorruptSnapshot(format!(
                "tensor '{}' has shape {:?}, expected two dimensions",
                name, other
            )))
        }
    };
    let values: Vec<f32> = view
        .data()
        .chunks_exact(std::mem::size_of::<f32>())
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Array2::from_shape_vec((rows, cols), values)
        .map(Some)
        .map_err(|e| NetError::CorruptSnapshot(format!("tensor '{}': {}", name, e)))
}

fn moments_or_zeros(m: Option<Array2<f32>>, v: Option<Array2<f32>>, shape: (usize, usize)) -> Moments {
    Moments {
        m: m.unwrap_or_else(|| Array2::zeros(shape)),
        v: v.unwrap_or_else(|| Array2::zeros(shape)),
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str, field: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| NetError::CorruptSnapshot(format!("metadata '{}' is not a number: {:?}", field, raw)))
}

fn counter(metadata: &HashMap<String, String>, field: &str) -> Result<u64> {
    metadata
        .get(field)
        .map(|raw| parse_number(raw, field))
        .unwrap_or(Ok(0))
}

#[derive(Serialize, Deserialize)]
struct LegacyDump {
    vocab: Vec<char>,
    #[serde(default)]
    hidden_size: Option<usize>,
    w_embed: Array2<f32>,
    w_out: Array2<f32>,
    b_hidden: Array2<f32>,
    b_out: Array2<f32>,
    m_w_embed: Option<Array2<f32>>,
    v_w_embed: Option<Array2<f32>>,
    m_w_out: Option<Array2<f32>>,
    v_w_out: Option<Array2<f32>>,
    m_b_hidden: Option<Array2<f32>>,
    v_b_hidden: Option<Array2<f32>>,
    m_b_out: Option<Array2<f32>>,
    v_b_out: Option<Array2<f32>>,
    #[serde(default)]
    t: u64,
    #[serde(default)]
    interactions: u64,
    #[serde(default)]
    characters_total: u64,
    #[serde(default)]
    learning_rate: Option<f32>,
}

pub fn encode_legacy_json(snapshot: &NetworkSnapshot) -> Result<Vec<u8>> {
    let p = &snapshot.params;
    let dump = LegacyDump {
        vocab: snapshot.vocab.clone(),
        hidden_size: Some(snapshot.hidden_size),
        w_embed: p.w_embed.clone(),
        w_out: p.w_out.clone(),
        b_hidden: p.b_hidden.clone(),
        b_out: p.b_out.clone(),
        m_w_embed: Some(p.adam_w_embed.m.clone()),
        v_w_embed: Some(p.adam_w_embed.v.clone()),
        m_w_out: Some(p.adam_w_out.m.clone()),
        v_w_out: Some(p.adam_w_out.v.clone()),
        m_b_hidden: Some(p.adam_b_hidden.m.clone()),
        v_b_hidden: Some(p.adam_b_hidden.v.clone()),
        m_b_out: Some(p.adam_b_out.m.clone()),
        v_b_out: Some(p.adam_b_out.v.clone()),
        t: snapshot.step,
        interactions: snapshot.interactions,
        characters_total: snapshot.characters_total,
        learning_rate: snapshot.learning_rate,
    };
    Ok(serde_json::to_vec(&dump)?)
}

pub fn decode_legacy_json(bytes: &[u8]) -> Result<NetworkSnapshot> {
    let dump: LegacyDump = serde_json::from_slice(bytes)?;
    let hidden_size = dump.hidden_size.unwrap_or_else(|| dump.w_embed.ncols());
    let params = ParameterStore {
        adam_w_embed: moments_or_zeros(dump.m_w_embed, dump.v_w_embed, dump.w_embed.dim()),
        adam_w_out: moments_or_zeros(dump.m_w_out, dump.v_w_out, dump.w_out.dim()),
        adam_b_hidden: moments_or_zeros(dump.m_b_hidden, dump.v_b_hidden, dump.b_hidden.dim()),
        adam_b_out: moments_or_zeros(dump.m_b_out, dump.v_b_out, dump.b_out.dim()),
        w_embed: dump.w_embed,
        w_out: dump.w_out,
        b_hidden: dump.b_hidden,
        b_out: dump.b_out,
    };
    Ok(NetworkSnapshot {
        vocab: dump.vocab,
        hidden_size,
        params,
        step: dump.t,
        interactions: dump.interactions,
        characters_total: dump.characters_total,
        learning_rate: dump.learning_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn trained_net() -> GrowingNetwork {
        let mut net = GrowingNetwork::seeded(" abc.", 8, 42);
        net.learn("abc. cab. bac.", 2, None);
        net
    }

    #[test]
    fn test_safetensors_round_trip_is_exact() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("brain.safetensors");
        let net = trained_net();
        net.save(&path)?;

        let loaded = GrowingNetwork::load(&path)?;
        assert_eq!(loaded.snapshot(), net.snapshot());
        Ok(())
    }

    #[test]
    fn test_legacy_round_trip_is_exact() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("brain.json");
        let net = trained_net();
        net.save(&path)?;
        assert_eq!(SnapshotFormat::sniff(&fs::read(&path)?)?, SnapshotFormat::LegacyJson);

        let loaded = GrowingNetwork::load(&path)?;
        assert_eq!(loaded.snapshot(), net.snapshot());
        Ok(())
    }

    #[test]
    fn test_format_detection() -> std::result::Result<(), Box<dyn std::error::Error>> {
        assert_eq!(
            SnapshotFormat::from_extension(Path::new("a/b.safetensors")),
            Some(SnapshotFormat::SafeTensors)
        );
        assert_eq!(SnapshotFormat::from_extension(Path::new("brain.bin")), None);
        assert_eq!(SnapshotFormat::sniff(b"  {\"vocab\": []}")?, SnapshotFormat::LegacyJson);
        assert_eq!(
            SnapshotFormat::sniff(&[2, 0, 0, 0, 0, 0, 0, 0, b'{', b'}'])?,
            SnapshotFormat::SafeTensors
        );
        assert!(matches!(
            SnapshotFormat::sniff(&[16, 0, 0, 0, 0, 0, 0, 0]),
            Err(NetError::UnsupportedFormat(_))
        ));
        Ok(())
    }

    #[test]
    fn test_unrecognised_bytes_fail_to_load() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("brain.bin");
        fs::write(&path, b"not a brain")?;
        assert!(matches!(read_snapshot(&path), Err(NetError::UnsupportedFormat(_))));
        Ok(())
    }

    #[test]
    fn test_legacy_without_optional_fields_defaults_to_zero() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let json = r#"{
            "vocab": ["a", "b"],
            "w_embed": {"v": 1, "dim": [2, 1], "data": [0.5, -0.5]},
            "w_out": {"v": 1, "dim": [1, 2], "data": [0.25, 0.75]},
            "b_hidden": {"v": 1, "dim": [1, 1], "data": [0.0]},
            "b_out": {"v": 1, "dim": [1, 2], "data": [0.1, 0.2]}
        }"#;
        let snapshot = decode_legacy_json(json.as_bytes())?;
        assert_eq!(snapshot.hidden_size, 1);
        assert_eq!(snapshot.step, 0);
        assert_eq!(snapshot.interactions, 0);
        assert!(snapshot.params.adam_w_out.m.iter().all(|x| *x == 0.0));
        assert_eq!(snapshot.params.adam_b_out.v.dim(), (1, 2));

        let net = GrowingNetwork::from_snapshot(snapshot, &NetConfig::default())?;
        assert_eq!(net.vocab_size(), 2);
        Ok(())
    }

    #[test]
    fn test_inconsistent_snapshot_is_rejected() {
        let mut snapshot = trained_net().snapshot();
        snapshot.vocab.pop();
        match GrowingNetwork::from_snapshot(snapshot, &NetConfig::default()) {
            Err(NetError::CorruptSnapshot(msg)) => assert!(msg.contains("w_embed")),
            other => panic!("expected CorruptSnapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_file_is_an_error() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.safetensors");
        fs::write(&path, b"not a snapshot at all")?;
        assert!(GrowingNetwork::load(&path).is_err());
        Ok(())
    }

    #[test]
    fn test_migration_rewrites_legacy_as_safetensors() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("brain.safetensors");
        let net = trained_net();
        net.save_as(legacy_path(&path), SnapshotFormat::LegacyJson)?;

        let migrated = load_with_migration(&path, &NetConfig::default())?;
        let migrated = migrated.ok_or("legacy snapshot was not picked up")?;
        assert_eq!(migrated.snapshot(), net.snapshot());
        assert!(path.exists());
        assert_eq!(SnapshotFormat::sniff(&fs::read(&path)?)?, SnapshotFormat::SafeTensors);
        Ok(())
    }

    #[test]
    fn test_migration_with_nothing_on_disk() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let found = load_with_migration(dir.path().join("absent.safetensors"), &NetConfig::default())?;
        assert!(found.is_none());
        Ok(())
    }
}
