use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use image::{DynamicImage, ImageFormat, ImageReader};
use tokio::{fs as async_fs, sync::Mutex};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::models::{IMAGE_EXTENSIONS, RunId, SEGMENT_EXTENSION, SegmentId};

const INPUT_DIR_NAME: &str = "input_images";
const OUTPUT_DIR_NAME: &str = "output";
const SEGMENTED_DIR_NAME: &str = "segmented_objects";
const TEXT_EXTRACTION_DIR_NAME: &str = "text_extraction";
const SUMMARIZATION_DIR_NAME: &str = "summarization";
const REPORT_DIR_NAME: &str = "report";

/// An upload accepted into the input directory.
#[derive(Debug, Clone)]
pub struct StoredInput {
    pub file_name: String,
    pub width: u32,
    pub height: u32,
}

/// On-disk layout for uploads, segment crops and stage outputs.
///
/// Append-only: nothing is ever deleted or overwritten. Segment writes and
/// listings are serialised through one lock per store.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl ArtifactStore {
    /// Open (creating if needed) the layout rooted at `root`.
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let store = Self {
            root: root.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        };
        for dir in [
            store.input_dir(),
            store.output_dir().join(SEGMENTED_DIR_NAME),
            store.text_extraction_dir(),
            store.summarization_dir(),
            store.report_dir(),
        ] {
            async_fs::create_dir_all(&dir)
                .await
                .map_err(|e| PipelineError::storage(format!("creating {}", dir.display()), e))?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join(INPUT_DIR_NAME)
    }

    fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR_NAME)
    }

    /// Directory holding the crops of one detection run.
    pub fn segments_dir(&self, run: &RunId) -> PathBuf {
        self.output_dir().join(SEGMENTED_DIR_NAME).join(run.to_string())
    }

    pub fn text_extraction_dir(&self) -> PathBuf {
        self.output_dir().join(TEXT_EXTRACTION_DIR_NAME)
    }

    pub fn summarization_dir(&self) -> PathBuf {
        self.output_dir().join(SUMMARIZATION_DIR_NAME)
    }

    pub fn report_dir(&self) -> PathBuf {
        self.output_dir().join(REPORT_DIR_NAME)
    }

    pub fn input_image_path(&self, file_name: &str) -> PathBuf {
        self.input_dir().join(file_name)
    }

    pub fn segment_path(&self, run: &RunId, id: &SegmentId) -> PathBuf {
        self.segments_dir(run).join(id.file_name())
    }

    /// Validate an image file and copy it into the input directory.
    pub async fn add_input_image<P: AsRef<Path>>(&self, source: P) -> Result<StoredInput> {
        let source = source.as_ref();
        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PipelineError::Validation(format!("no usable file name in {:?}", source)))?
            .to_string();

        if !has_image_extension(&file_name) {
            return Err(PipelineError::Validation(format!(
                "{file_name}: unsupported file type (expected one of {})",
                IMAGE_EXTENSIONS.join(", ")
            )));
        }

        let image = decode_upload(source)
            .map_err(|e| PipelineError::Validation(format!("{file_name}: {e:#}")))?;

        let _guard = self.lock.lock().await;
        let dest = self.input_image_path(&file_name);
        if exists(&dest).await? {
            return Err(PipelineError::Validation(format!(
                "an image named {file_name} was already uploaded"
            )));
        }
        async_fs::copy(source, &dest).await.map_err(|e| {
            PipelineError::storage(format!("copying {} to {}", source.display(), dest.display()), e)
        })?;

        info!("Saved upload {} ({}x{})", file_name, image.width(), image.height());
        Ok(StoredInput {
            file_name,
            width: image.width(),
            height: image.height(),
        })
    }

    /// Uploaded images, oldest first.
    pub async fn list_input_images(&self) -> Result<Vec<String>> {
        let dir = self.input_dir();
        let mut entries = async_fs::read_dir(&dir)
            .await
            .map_err(|e| PipelineError::storage(format!("listing {}", dir.display()), e))?;

        let mut images: Vec<(SystemTime, String)> = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::storage(format!("listing {}", dir.display()), e))?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !has_image_extension(&name) {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            images.push((modified, name));
        }
        images.sort();
        Ok(images.into_iter().map(|(_, name)| name).collect())
    }

    pub async fn load_input_image(&self, file_name: &str) -> Result<DynamicImage> {
        let path = self.input_image_path(file_name);
        if !exists(&path).await? {
            return Err(PipelineError::NotFound(format!("input image {file_name}")));
        }
        image::open(&path).map_err(|e| PipelineError::storage(format!("decoding {}", path.display()), e))
    }

    /// Segments of one run, ordered by the ordinal encoded in each file name.
    pub async fn list_segments(&self, run: &RunId) -> Result<Vec<SegmentId>> {
        let _guard = self.lock.lock().await;
        let dir = self.segments_dir(run);
        if !exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut entries = async_fs::read_dir(&dir)
            .await
            .map_err(|e| PipelineError::storage(format!("listing {}", dir.display()), e))?;
        let mut segments = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PipelineError::storage(format!("listing {}", dir.display()), e))?
        {
            let name = entry.file_name();
            match name.to_str().and_then(SegmentId::from_file_name) {
                Some(id) => segments.push(id),
                None => debug!("Ignoring non-segment file {:?} in {}", name, dir.display()),
            }
        }
        segments.sort();
        segments.dedup();
        Ok(segments)
    }

    /// Persist one crop as `{ordinal}_{class_label}.png` in the run directory.
    pub async fn write_segment(
        &self,
        run: &RunId,
        crop: &DynamicImage,
        ordinal: u32,
        class_label: u32,
    ) -> Result<SegmentId> {
        let id = SegmentId::new(ordinal, class_label);
        let _guard = self.lock.lock().await;

        let dir = self.segments_dir(run);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| PipelineError::storage(format!("creating {}", dir.display()), e))?;

        let path = dir.join(id.file_name());
        if exists(&path).await? {
            return Err(PipelineError::storage(
                format!("writing segment {id}"),
                format!("{} already exists", path.display()),
            ));
        }

        // Write under a temporary name so a half-written crop is never listed.
        let tmp = dir.join(format!(".{}.tmp", id.file_name()));
        crop.save_with_format(&tmp, ImageFormat::Png)
            .map_err(|e| PipelineError::storage(format!("writing segment {id} to {}", tmp.display()), e))?;
        async_fs::rename(&tmp, &path)
            .await
            .map_err(|e| PipelineError::storage(format!("writing segment {id} to {}", path.display()), e))?;

        debug!("Stored segment {} ({}x{})", path.display(), crop.width(), crop.height());
        Ok(id)
    }

    pub async fn read_segment(&self, run: &RunId, id: &SegmentId) -> Result<DynamicImage> {
        let path = self.segment_path(run, id);
        if !exists(&path).await? {
            return Err(PipelineError::NotFound(format!("segment {id} in run {run}")));
        }
        image::open(&path).map_err(|e| PipelineError::storage(format!("reading segment {id}"), e))
    }
}

/// Like `try_exists`, but an inaccessible path is a storage error rather than "absent".
async fn exists(path: &Path) -> Result<bool> {
    async_fs::try_exists(path)
        .await
        .map_err(|e| PipelineError::storage(format!("checking {}", path.display()), e))
}

fn has_image_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn decode_upload(path: &Path) -> anyhow::Result<DynamicImage> {
    let image = ImageReader::open(path)
        .with_context(|| format!("failed to open {:?}", path))?
        .with_guessed_format()
        .context("failed to sniff image format")?
        .decode()
        .context("failed to decode image")?;
    Ok(image)
}
