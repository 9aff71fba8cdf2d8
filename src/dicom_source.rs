//! [`PixelSource`] and [`GeometrySource`] backed by in-memory DICOM objects.
//!
//! Decoding is delegated to the dicom-rs pixel data pipeline; this module
//! only reads the attributes reconstruction needs and groups images into
//! series.

use std::collections::{BTreeMap, HashMap};
use std::{fs, path::Path};

use dicom::core::Tag;
use dicom::object::{FileDicomObject, InMemDicomObject, open_file};
use dicom::pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption};
use dicom_dictionary_std::tags;
use log::{debug, warn};
use ndarray::s;

use crate::geometry::Vec3;
use crate::slice_loader::{
    GeometrySource, PixelData, PixelSource, SeriesInput, SliceGeometry, SourceError,
};

pub struct DicomSource {
    objects: HashMap<String, FileDicomObject<InMemDicomObject>>,
}

impl DicomSource {
    /// Indexes objects by SOP Instance UID and groups them by Series
    /// Instance UID. Series are returned in UID order.
    pub fn from_dicom_objects(
        dicom_objects: Vec<FileDicomObject<InMemDicomObject>>,
    ) -> (Self, Vec<SeriesInput>) {
        let mut objects = HashMap::with_capacity(dicom_objects.len());
        let mut series: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (i, dicom_object) in dicom_objects.into_iter().enumerate() {
            let image_id = Self::string_value(&dicom_object, tags::SOP_INSTANCE_UID)
                .unwrap_or_else(|| format!("image-{i}"));
            let series_uid = Self::string_value(&dicom_object, tags::SERIES_INSTANCE_UID)
                .unwrap_or_else(|| "unknown-series".to_string());

            if objects.contains_key(&image_id) {
                warn!("Duplicate SOP Instance UID {image_id}, keeping the first");
                continue;
            }
            series.entry(series_uid).or_default().push(image_id.clone());
            objects.insert(image_id, dicom_object);
        }

        let inputs = series
            .into_iter()
            .map(|(series_uid, image_ids)| SeriesInput {
                series_uid,
                image_ids,
            })
            .collect();

        (Self { objects }, inputs)
    }

    /// Load objects from file paths
    pub fn load_from_file_paths(
        paths: &[impl AsRef<Path>],
    ) -> Result<(Self, Vec<SeriesInput>), SourceError> {
        let objects: Result<Vec<_>, _> =
            paths.iter().map(|path| open_file(path.as_ref())).collect();

        Ok(Self::from_dicom_objects(objects?))
    }

    /// Load every ".dcm" file of a directory
    pub fn load_from_directory(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<SeriesInput>), SourceError> {
        let paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        debug!("Found {} DICOM files in {}", paths.len(), path.as_ref().display());
        Self::load_from_file_paths(&paths)
    }

    fn object(&self, image_id: &str) -> Result<&FileDicomObject<InMemDicomObject>, SourceError> {
        self.objects
            .get(image_id)
            .ok_or_else(|| SourceError::NotFound(image_id.to_string()))
    }

    fn string_value(dicom_object: &FileDicomObject<InMemDicomObject>, tag: Tag) -> Option<String> {
        let value = dicom_object.element(tag).ok()?.to_str().ok()?;
        let value = value.trim_end_matches('\0').trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    fn floats(dicom_object: &FileDicomObject<InMemDicomObject>, tag: Tag) -> Option<Vec<f64>> {
        dicom_object
            .element(tag)
            .ok()?
            .to_multi_float64()
            .ok()
    }

    fn float(dicom_object: &FileDicomObject<InMemDicomObject>, tag: Tag) -> Option<f64> {
        dicom_object.element(tag).ok()?.to_float64().ok()
    }

    fn required(
        image_id: &str,
        attribute: &'static str,
        values: Option<Vec<f64>>,
        len: usize,
    ) -> Result<Vec<f64>, SourceError> {
        values
            .filter(|v| v.len() >= len)
            .ok_or_else(|| SourceError::MissingAttribute {
                image_id: image_id.to_string(),
                attribute,
            })
    }
}

impl PixelSource for DicomSource {
    fn pixel_data(&self, image_id: &str) -> Result<PixelData, SourceError> {
        let dicom_object = self.object(image_id)?;
        let decode_err = |reason: String| SourceError::Decode {
            image_id: image_id.to_string(),
            reason,
        };

        let pixel_data = dicom_object
            .decode_pixel_data()
            .map_err(|e| decode_err(e.to_string()))?;
        // Modality rescale only, no VOI LUT.
        let options = ConvertOptions::new().with_voi_lut(VoiLutOption::Identity);
        let frame = pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .map_err(|e| decode_err(e.to_string()))?
            .slice_move(s![0, .., .., 0]);

        let (rows, columns) = frame.dim();
        Ok(PixelData {
            rows,
            columns,
            pixels: frame.iter().copied().collect(),
        })
    }
}

impl GeometrySource for DicomSource {
    fn slice_geometry(&self, image_id: &str) -> Result<SliceGeometry, SourceError> {
        let dicom_object = self.object(image_id)?;

        let position = Self::required(
            image_id,
            "ImagePositionPatient",
            Self::floats(dicom_object, tags::IMAGE_POSITION_PATIENT),
            3,
        )?;
        let orientation = Self::required(
            image_id,
            "ImageOrientationPatient",
            Self::floats(dicom_object, tags::IMAGE_ORIENTATION_PATIENT),
            6,
        )?;
        let spacing = Self::required(
            image_id,
            "PixelSpacing",
            Self::floats(dicom_object, tags::PIXEL_SPACING),
            2,
        )?;

        // The first orientation triplet runs along a row (+1 column), the
        // second down a column (+1 row). PixelSpacing is (row, column).
        Ok(SliceGeometry {
            row_spacing_mm: spacing[0],
            col_spacing_mm: spacing[1],
            ipp_mm: Vec3::new(position[0], position[1], position[2]),
            row_dir: Vec3::new(orientation[3], orientation[4], orientation[5]),
            col_dir: Vec3::new(orientation[0], orientation[1], orientation[2]),
            slice_thickness_mm: Self::float(dicom_object, tags::SLICE_THICKNESS),
            spacing_between_slices_mm: Self::float(dicom_object, tags::SPACING_BETWEEN_SLICES),
        })
    }
}
