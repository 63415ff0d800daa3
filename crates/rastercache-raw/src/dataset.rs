//! Opening and creating raw datasets described by ENVI headers

use crate::codec::RawBandCodec;
use crate::header::{EnviHeader, find_header_file};
use rastercache_common::{Access, ByteOrder, DataType, Error, Interleave, Result};
use rastercache_core::{
    BandSpec, Dataset, Driver, GlobalBlockPool, LayoutParams, RawFile, compute_layout,
    required_file_size,
};
use std::io::Read as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Header keys that describe storage rather than content
const STRUCTURAL_KEYS: [&str; 12] = [
    "samples",
    "lines",
    "bands",
    "header_offset",
    "data_type",
    "interleave",
    "byte_order",
    "file_compression",
    "major_frame_offsets",
    "band_names",
    "wavelength",
    "description",
];

/// File types that carry no raster of their own
const UNSUPPORTED_FILE_TYPES: [&str; 3] = [
    "envi meta file",
    "envi virtual mosaic",
    "envi spectral library",
];

/// Driver for a flat binary file next to an ENVI `.hdr` header
#[derive(Clone, Copy, Debug, Default)]
pub struct RawDriver;

impl RawDriver {
    pub const NAME: &'static str = "ENVI";

    pub fn new() -> Self {
        Self
    }

    /// Write a header for a new zero-filled raster and open it for update
    ///
    /// The header goes next to `path` with its extension replaced by `hdr`.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        path: &Path,
        samples: usize,
        lines: usize,
        bands: usize,
        data_type: DataType,
        interleave: Interleave,
        byte_order: ByteOrder,
        pool: Arc<GlobalBlockPool>,
    ) -> Result<Dataset> {
        let header_path = path.with_extension("hdr");
        if header_path == path {
            return Err(Error::invalid_argument(format!(
                "data file {} cannot use the header extension",
                path.display()
            )));
        }
        let layouts = compute_layout(&LayoutParams {
            samples,
            lines,
            bands,
            data_type,
            interleave,
            header_offset: 0,
            byte_order,
            compressed: false,
            frame_offsets: None,
        })?;

        let mut header = EnviHeader::new();
        header.set("samples", samples.to_string());
        header.set("lines", lines.to_string());
        header.set("bands", bands.to_string());
        header.set("header offset", "0");
        header.set("file type", "ENVI Standard");
        header.set("data type", data_type.envi_code().to_string());
        header.set("interleave", interleave.keyword());
        header.set(
            "byte order",
            match byte_order {
                ByteOrder::LittleEndian => "0",
                ByteOrder::BigEndian => "1",
            },
        );
        header.write(&header_path)?;

        let size = required_file_size(&layouts, samples, lines);
        drop(RawFile::create(path, size)?);
        info!(path = %path.display(), samples, lines, bands, %data_type, %interleave, "created raw dataset");

        self.open_with_header(path, &header_path, Access::Update, pool)
    }

    fn open_with_header(
        &self,
        path: &Path,
        header_path: &Path,
        access: Access,
        pool: Arc<GlobalBlockPool>,
    ) -> Result<Dataset> {
        let header = EnviHeader::read(header_path)?;

        if let Some(file_type) = header.get("file_type") {
            let lowered = file_type.trim().to_ascii_lowercase();
            if let Some(kind) = UNSUPPORTED_FILE_TYPES.iter().find(|t| lowered.starts_with(**t)) {
                return Err(Error::configuration(format!(
                    "{}: file type `{kind}` is not a raster",
                    path.display()
                )));
            }
        }

        let samples = header.require_dimension("samples")?;
        let lines = header.require_dimension("lines")?;
        let bands = header.require_dimension("bands")?;
        let interleave = interleave_of(&header, path);
        let data_type = data_type_of(&header)?;
        let byte_order = match header.get("byte_order") {
            Some(v) if v.trim() == "0" => ByteOrder::LittleEndian,
            Some(_) => ByteOrder::BigEndian,
            None => ByteOrder::native(),
        };
        let header_offset = header.get_u64_or("header_offset", 0)?;
        let compressed = header.get_u64_or("file_compression", 0)? != 0;
        let frame_offsets = frame_offsets_of(&header);

        let layouts = compute_layout(&LayoutParams {
            samples,
            lines,
            bands,
            data_type,
            interleave,
            header_offset,
            byte_order,
            compressed,
            frame_offsets,
        })?;

        let file = Arc::new(RawFile::open(path, access, compressed)?);
        let required = required_file_size(&layouts, samples, lines);
        if file.size() < required {
            warn!(
                path = %path.display(),
                size = file.size(),
                required,
                "data file is shorter than its header describes; missing pixels read as zero"
            );
        }

        let specs = layouts
            .into_iter()
            .map(|layout| BandSpec {
                data_type,
                block_width: samples,
                block_height: 1,
                codec: Arc::new(RawBandCodec::new(Arc::clone(&file), layout, samples, lines)),
            })
            .collect();
        let dataset = Dataset::new(
            path.display().to_string(),
            samples,
            lines,
            access,
            interleave,
            specs,
            pool,
        )?;
        apply_metadata(&dataset, &header);
        debug!(
            path = %path.display(),
            header = %header_path.display(),
            ?byte_order,
            compressed,
            "opened raw dataset"
        );
        Ok(dataset)
    }
}

impl Driver for RawDriver {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn identify(&self, path: &Path) -> bool {
        if is_header_path(path) {
            return false;
        }
        let Some(header_path) = find_header_file(path) else {
            return false;
        };
        let mut magic = [0u8; 4];
        std::fs::File::open(header_path)
            .and_then(|f| f.take(4).read_exact(&mut magic))
            .is_ok_and(|()| &magic == b"ENVI")
    }

    fn open(&self, path: &Path, access: Access, pool: Arc<GlobalBlockPool>) -> Result<Dataset> {
        if is_header_path(path) {
            return Err(Error::configuration(format!(
                "{} is a header; open the data file instead",
                path.display()
            )));
        }
        let header_path: PathBuf = find_header_file(path).ok_or_else(|| {
            Error::configuration(format!("no .hdr header found for {}", path.display()))
        })?;
        self.open_with_header(path, &header_path, access, pool)
    }
}

fn is_header_path(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("hdr"))
}

/// Interleave from the header, else from the data file extension
fn interleave_of(header: &EnviHeader, path: &Path) -> Interleave {
    if let Some(keyword) = header.get("interleave") {
        return Interleave::parse_or_bsq(keyword);
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    Interleave::parse_or_bsq(ext)
}

fn data_type_of(header: &EnviHeader) -> Result<DataType> {
    let code = header.get_u64_or("data_type", 1)?;
    u32::try_from(code)
        .ok()
        .and_then(DataType::from_envi_code)
        .ok_or_else(|| Error::configuration(format!("unsupported data type code {code}")))
}

fn frame_offsets_of(header: &EnviHeader) -> Option<(u64, u64)> {
    let values = header.get_list("major_frame_offsets")?;
    match values.as_slice() {
        [before, after] => match (before.parse(), after.parse()) {
            (Ok(before), Ok(after)) => Some((before, after)),
            _ => {
                warn!(?values, "ignoring non-numeric major frame offsets");
                None
            }
        },
        _ => {
            warn!(?values, "major frame offsets need exactly two values");
            None
        }
    }
}

fn unbrace(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix('{')
        .and_then(|v| v.strip_suffix('}'))
        .unwrap_or(value)
        .trim()
        .to_string()
}

/// Copy descriptive header keys into dataset and band metadata
fn apply_metadata(dataset: &Dataset, header: &EnviHeader) {
    for (key, value) in header.entries() {
        if !STRUCTURAL_KEYS.contains(&key) {
            dataset.set_metadata_item(key, value);
        }
    }
    if let Some(description) = header.get("description") {
        dataset.set_metadata_item("description", unbrace(description));
    }
    dataset.set_metadata_item(
        "INTERLEAVE",
        match dataset.interleave() {
            Interleave::Bsq => "BAND",
            Interleave::Bil => "LINE",
            Interleave::Bip => "PIXEL",
        },
    );

    let names = header.get_list("band_names").unwrap_or_default();
    let wavelengths = header.get_list("wavelength").unwrap_or_default();
    let units = header
        .get("wavelength_units")
        .map(str::trim)
        .filter(|u| !u.eq_ignore_ascii_case("unknown") && !u.eq_ignore_ascii_case("index"));

    for (i, band) in dataset.bands().iter().enumerate() {
        let name = names.get(i).map(String::as_str).unwrap_or_default();
        let wavelength = wavelengths.get(i).map(|wl| match units {
            Some(units) => format!("{wl} {units}"),
            None => wl.clone(),
        });
        let description = match (name.is_empty(), wavelength) {
            (false, Some(wl)) => format!("{name} ({wl})"),
            (false, None) => name.to_string(),
            (true, Some(wl)) => wl,
            (true, None) => continue,
        };
        dataset.set_metadata_item(format!("Band_{}", i + 1), description.clone());
        band.set_description(description);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rastercache_common::{CacheConfig, Window};
    use rastercache_core::{IoBuffer, IoStatus, RasterIoOptions};
    use tempfile::tempdir;

    fn pool() -> Arc<GlobalBlockPool> {
        Arc::new(GlobalBlockPool::new(CacheConfig::with_max_bytes(1 << 20)))
    }

    #[test]
    fn test_open_reads_header_and_metadata() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("scene.img");
        std::fs::write(&data, (0u8..24).collect::<Vec<_>>()).unwrap();
        std::fs::write(
            dir.path().join("scene.hdr"),
            "ENVI\ndescription = {Test scene}\nsamples = 4\nlines = 3\nbands = 2\n\
             data type = 1\ninterleave = bsq\nsensor type = Unknown\n\
             band names = {red, nir}\nwavelength = {650, 860}\nwavelength units = Nanometers\n",
        )
        .unwrap();

        let driver = RawDriver::new();
        assert!(driver.identify(&data));
        assert!(!driver.identify(&dir.path().join("scene.hdr")));

        let ds = driver.open(&data, Access::ReadOnly, pool()).unwrap();
        assert_eq!((ds.x_size(), ds.y_size(), ds.band_count()), (4, 3, 2));
        assert_eq!(ds.metadata_item("description").as_deref(), Some("Test scene"));
        assert_eq!(ds.metadata_item("sensor_type").as_deref(), Some("Unknown"));
        assert_eq!(ds.metadata_item("INTERLEAVE").as_deref(), Some("BAND"));
        assert_eq!(ds.metadata_item("Band_2").as_deref(), Some("nir (860 Nanometers)"));
        assert_eq!(ds.band(1).unwrap().description(), "red (650 Nanometers)");
        assert_eq!(ds.band(1).unwrap().block_size(), (4, 1));

        let mut buf = [0u8; 4];
        let status = ds
            .band(2)
            .unwrap()
            .raster_io(
                Window::new(0, 1, 4, 1),
                IoBuffer::Read(&mut buf),
                4,
                1,
                &RasterIoOptions::default(),
            )
            .unwrap();
        assert_eq!(status, IoStatus::Completed);
        assert_eq!(buf, [16, 17, 18, 19]);
    }

    #[test]
    fn test_interleave_falls_back_to_extension() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("scene.bip");
        std::fs::write(&data, [0u8; 8]).unwrap();
        std::fs::write(
            dir.path().join("scene.bip.hdr"),
            "ENVI\nsamples = 2\nlines = 2\nbands = 2\n",
        )
        .unwrap();
        let ds = RawDriver.open(&data, Access::ReadOnly, pool()).unwrap();
        assert_eq!(ds.interleave(), Interleave::Bip);
        assert_eq!(ds.band(1).unwrap().data_type(), DataType::Byte);
    }

    #[test]
    fn test_rejections() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("lib.sli");
        std::fs::write(&data, [0u8; 4]).unwrap();
        let header = dir.path().join("lib.hdr");

        std::fs::write(
            &header,
            "ENVI\nsamples = 2\nlines = 2\nbands = 1\nfile type = ENVI Spectral Library\n",
        )
        .unwrap();
        assert!(matches!(
            RawDriver.open(&data, Access::ReadOnly, pool()),
            Err(Error::Configuration(_))
        ));

        std::fs::write(&header, "ENVI\nsamples = 2\nlines = 2\nbands = 1\ndata type = 7\n").unwrap();
        assert!(matches!(
            RawDriver.open(&data, Access::ReadOnly, pool()),
            Err(Error::Configuration(_))
        ));

        std::fs::write(&header, "ENVI\nsamples = 2\nbands = 1\n").unwrap();
        assert!(RawDriver.open(&data, Access::ReadOnly, pool()).is_err());

        assert!(matches!(
            RawDriver.open(&header, Access::ReadOnly, pool()),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            RawDriver.open(&dir.path().join("missing.dat"), Access::ReadOnly, pool()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_create_writes_header() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("new.bil");
        let ds = RawDriver
            .create(&data, 5, 4, 3, DataType::Int16, Interleave::Bil, ByteOrder::BigEndian, pool())
            .unwrap();
        assert_eq!(ds.access(), Access::Update);
        drop(ds);

        let text = std::fs::read_to_string(dir.path().join("new.hdr")).unwrap();
        assert_eq!(
            text,
            "ENVI\nsamples = 5\nlines = 4\nbands = 3\nheader offset = 0\n\
             file type = ENVI Standard\ndata type = 2\ninterleave = bil\nbyte order = 1\n"
        );
        assert_eq!(std::fs::metadata(&data).unwrap().len(), 5 * 4 * 3 * 2);
    }

    #[test]
    fn test_frame_offsets() {
        let header = EnviHeader::parse("ENVI\nmajor frame offsets = {4, 2}\n").unwrap();
        assert_eq!(frame_offsets_of(&header), Some((4, 2)));
        let header = EnviHeader::parse("ENVI\nmajor frame offsets = {4}\n").unwrap();
        assert_eq!(frame_offsets_of(&header), None);
    }
}
