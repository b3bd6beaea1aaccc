//! Bulk training over large texts and folders of `.txt` files.
//!
//! Text is cut into paragraph-aligned blocks which are fed to every brain in
//! turn. A shared stop flag is checked between blocks, and all brains are
//! checkpointed periodically and once more at the end.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};

use crate::brain::Brain;
use crate::error::Result;

pub const DEFAULT_BLOCK_CHARS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingOptions {
    pub epochs: usize,
    pub block_chars: usize,
    /// Save every brain after this many blocks. 0 saves only at the end.
    pub checkpoint_every: usize,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            epochs: 5,
            block_chars: DEFAULT_BLOCK_CHARS,
            checkpoint_every: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingProgress {
    pub source: Option<PathBuf>,
    pub blocks_done: usize,
    pub blocks_total: usize,
    pub characters_done: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrainingSummary {
    pub files: usize,
    pub blocks: usize,
    pub characters: usize,
    pub interrupted: bool,
}

impl TrainingSummary {
    fn absorb(&mut self, other: TrainingSummary) {
        self.files += other.files;
        self.blocks += other.blocks;
        self.characters += other.characters;
        self.interrupted |= other.interrupted;
    }
}

/// Groups paragraphs (separated by blank lines) into blocks shorter than
/// `block_chars` characters. A paragraph that is too long on its own is cut
/// into fixed-size pieces.
pub fn split_into_blocks(text: &str, block_chars: usize) -> Vec<String> {
    let block_chars = block_chars.max(1);
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let len = paragraph.chars().count();
        if len >= block_chars {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = paragraph.chars().collect();
            blocks.extend(chars.chunks(block_chars).map(|c| c.iter().collect::<String>()));
            continue;
        }
        if current_len + len + 2 > block_chars && !current.is_empty() {
            blocks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(paragraph);
        current_len += len;
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// Trains every brain on `text`, block by block. Returns early (with
/// `interrupted` set) once `stop` is raised.
pub fn train_text(
    brains: &[&Brain],
    text: &str,
    options: &TrainingOptions,
    stop: &AtomicBool,
    mut on_progress: impl FnMut(&TrainingProgress),
) -> Result<TrainingSummary> {
    train_blocks(brains, None, text, options, stop, &mut on_progress)
}

/// Trains on every `.txt` file directly inside `folder`, in name order.
/// Files are decoded as UTF-8 with invalid sequences replaced.
pub fn train_folder(
    brains: &[&Brain],
    folder: &Path,
    options: &TrainingOptions,
    stop: &AtomicBool,
    mut on_progress: impl FnMut(&TrainingProgress),
) -> Result<TrainingSummary> {
    let mut files: Vec<PathBuf> = fs::read_dir(folder)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("txt"))
        .collect();
    files.sort();
    info!("training on {} files from {}", files.len(), folder.display());

    let mut summary = TrainingSummary::default();
    for file in &files {
        if stop.load(Ordering::Relaxed) {
            summary.interrupted = true;
            break;
        }
        let text = String::from_utf8_lossy(&fs::read(file)?).into_owned();
        let part = train_blocks(brains, Some(file), &text, options, stop, &mut on_progress)?;
        summary.absorb(part);
        summary.files += 1;
        if summary.interrupted {
            break;
        }
    }
    Ok(summary)
}

fn train_blocks(
    brains: &[&Brain],
    source: Option<&Path>,
    text: &str,
    options: &TrainingOptions,
    stop: &AtomicBool,
    on_progress: &mut dyn FnMut(&TrainingProgress),
) -> Result<TrainingSummary> {
    let blocks = split_into_blocks(text, options.block_chars);
    let mut summary = TrainingSummary::default();

    for (i, block) in blocks.iter().enumerate() {
        if stop.load(Ordering::Relaxed) {
            info!("training stopped after {} of {} blocks", i, blocks.len());
            summary.interrupted = true;
            break;
        }
        for brain in brains {
            brain.learn(block, options.epochs, None);
        }
        summary.blocks += 1;
        summary.characters += block.chars().count();
        on_progress(&TrainingProgress {
            source: source.map(Path::to_path_buf),
            blocks_done: i + 1,
            blocks_total: blocks.len(),
            characters_done: summary.characters,
        });

        if options.checkpoint_every > 0 && (i + 1) % options.checkpoint_every == 0 {
            save_all(brains)?;
            debug!("checkpoint after block {}", i + 1);
        }
    }
    save_all(brains)?;
    Ok(summary)
}

fn save_all(brains: &[&Brain]) -> Result<()> {
    for brain in brains {
        brain.save()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GrowingNetwork;
    use tempfile::tempdir;

    #[test]
    fn test_short_paragraphs_share_a_block() {
        let blocks = split_into_blocks("uno\n\ndos\n\n\n\ntres", 1000);
        assert_eq!(blocks, vec!["uno\n\ndos\n\ntres".to_string()]);
    }

    #[test]
    fn test_blocks_respect_limit() {
        let text = "aaaa\n\nbbbb\n\ncccc";
        let blocks = split_into_blocks(text, 10);
        assert_eq!(blocks, vec!["aaaa\n\nbbbb".to_string(), "cccc".to_string()]);
    }

    #[test]
    fn test_long_paragraph_is_chunked() {
        let text = "x".repeat(25);
        let blocks = split_into_blocks(&text, 10);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2], "xxxxx");
    }

    #[test]
    fn test_stop_flag_interrupts_between_blocks() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let brain = Brain::new("t", dir.path().join("t.safetensors"), GrowingNetwork::seeded("ab", 4, 1));
        let stop = AtomicBool::new(false);
        let options = TrainingOptions {
            epochs: 1,
            block_chars: 6,
            checkpoint_every: 0,
        };
        let text = "abab\n\nbaba\n\naabb\n\nbbaa";

        let summary = train_text(&[&brain], text, &options, &stop, |progress| {
            if progress.blocks_done == 2 {
                stop.store(true, Ordering::Relaxed);
            }
        })?;

        assert!(summary.interrupted);
        assert_eq!(summary.blocks, 2);
        assert_eq!(brain.stats().interactions, 2);
        assert!(brain.path().exists());
        Ok(())
    }

    #[test]
    fn test_train_folder_reads_only_txt() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("a.txt"), "hola")?;
        fs::write(dir.path().join("b.txt"), [0x68, 0x6f, 0xff, 0x61])?;
        fs::write(dir.path().join("ignored.md"), "nope")?;
        let brain = Brain::new("f", dir.path().join("f.safetensors"), GrowingNetwork::seeded("hola", 4, 2));

        let summary = train_folder(&[&brain], dir.path(), &TrainingOptions::default(), &AtomicBool::new(false), |_| {})?;
        assert_eq!(summary.files, 2);
        assert_eq!(summary.blocks, 2);
        assert!(!summary.interrupted);
        // The replacement character from the invalid byte joins the vocabulary.
        assert!(brain.with_network(|net| net.vocab().contains('\u{FFFD}')));
        Ok(())
    }
}
