//! In-memory 4-D images and NIfTI-1 file I/O.
//!
//! Voxel data is kept in Fortran order (x varies fastest), matching the
//! NIfTI on-disk layout: `index = x + y*nx + z*nx*ny + t*nx*ny*nz`.

use crate::error::{DwiError, Result};
use nifti::volume::ndarray::IntoNdArray;
use nifti::{NiftiHeader, NiftiObject, ReaderOptions};
use std::io::Write;
use std::path::Path;

/// Spatial grids whose voxel sizes differ by less than this are identical.
pub const GRID_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    /// (nx, ny, nz, nt); nt is 1 for 3-D images.
    pub dims: [usize; 4],
    pub voxel_size: [f64; 3],
    /// 4x4 row-major voxel-to-scanner transform.
    pub affine: [f64; 16],
    pub data: Vec<f64>,
}

impl Image {
    pub fn zeros(dims: [usize; 4], voxel_size: [f64; 3]) -> Self {
        let total = dims.iter().product();
        Self {
            dims,
            voxel_size,
            affine: scaled_identity(voxel_size),
            data: vec![0.0; total],
        }
    }

    pub fn from_fn(
        dims: [usize; 4],
        voxel_size: [f64; 3],
        f: impl Fn(usize, usize, usize, usize) -> f64,
    ) -> Self {
        let mut image = Self::zeros(dims, voxel_size);
        let [nx, ny, nz, nt] = dims;
        let mut idx = 0;
        for t in 0..nt {
            for z in 0..nz {
                for y in 0..ny {
                    for x in 0..nx {
                        image.data[idx] = f(x, y, z, t);
                        idx += 1;
                    }
                }
            }
        }
        image
    }

    pub fn num_volumes(&self) -> usize {
        self.dims[3]
    }

    pub fn volume_len(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    pub fn index(&self, x: usize, y: usize, z: usize, t: usize) -> usize {
        x + self.dims[0] * (y + self.dims[1] * (z + self.dims[2] * t))
    }

    pub fn get(&self, x: usize, y: usize, z: usize, t: usize) -> f64 {
        self.data[self.index(x, y, z, t)]
    }

    pub fn volume(&self, t: usize) -> &[f64] {
        let n = self.volume_len();
        &self.data[t * n..(t + 1) * n]
    }

    fn with_data(&self, nt: usize, data: Vec<f64>) -> Self {
        Self {
            dims: [self.dims[0], self.dims[1], self.dims[2], nt],
            voxel_size: self.voxel_size,
            affine: self.affine,
            data,
        }
    }

    /// New image holding the given volumes in the given order.
    pub fn select_volumes(&self, indices: &[usize]) -> Result<Self> {
        let n = self.volume_len();
        let mut data = Vec::with_capacity(n * indices.len());
        for &t in indices {
            if t >= self.num_volumes() {
                return Err(DwiError::metadata(format!(
                    "Volume index {} out of range for image with {} volumes",
                    t,
                    self.num_volumes()
                )));
            }
            data.extend_from_slice(self.volume(t));
        }
        Ok(self.with_data(indices.len(), data))
    }

    /// Concatenate volumes of `others` after those of `self`.
    pub fn concat(&self, other: &Image) -> Result<Self> {
        if !self.same_grid(other) {
            return Err(DwiError::metadata(format!(
                "Cannot concatenate images on different grids ({:?} vs {:?})",
                &self.dims[..3],
                &other.dims[..3]
            )));
        }
        let mut data = self.data.clone();
        data.extend_from_slice(&other.data);
        Ok(self.with_data(self.num_volumes() + other.num_volumes(), data))
    }

    /// Build a 4-D image from equally-sized volumes.
    pub fn from_volumes(template: &Image, volumes: Vec<Vec<f64>>) -> Result<Self> {
        let n = template.volume_len();
        if let Some(bad) = volumes.iter().position(|v| v.len() != n) {
            return Err(DwiError::metadata(format!(
                "Volume {} has {} voxels, expected {}",
                bad,
                volumes[bad].len(),
                n
            )));
        }
        let nt = volumes.len();
        Ok(template.with_data(nt, volumes.concat()))
    }

    pub fn same_grid(&self, other: &Image) -> bool {
        self.dims[..3] == other.dims[..3]
            && self
                .voxel_size
                .iter()
                .zip(other.voxel_size.iter())
                .all(|(a, b)| (a - b).abs() < GRID_TOLERANCE)
    }

    /// Axes (0..3) with an odd number of voxels.
    pub fn odd_axes(&self) -> Vec<usize> {
        (0..3).filter(|&a| self.dims[a] % 2 == 1).collect()
    }

    /// Append one slice along `axis`, duplicating the last existing slice.
    pub fn pad_axis(&self, axis: usize) -> Self {
        let mut dims = self.dims;
        dims[axis] += 1;
        let last = self.dims[axis] - 1;
        let src = self;
        Image::from_fn_with_affine(dims, self.voxel_size, self.affine, |x, y, z, t| {
            let mut c = [x, y, z];
            if c[axis] > last {
                c[axis] = last;
            }
            src.get(c[0], c[1], c[2], t)
        })
    }

    /// Keep the first `size` slices along `axis`.
    pub fn crop_axis(&self, axis: usize, size: usize) -> Self {
        let mut dims = self.dims;
        dims[axis] = size.min(self.dims[axis]);
        let src = self;
        Image::from_fn_with_affine(dims, self.voxel_size, self.affine, |x, y, z, t| {
            src.get(x, y, z, t)
        })
    }

    fn from_fn_with_affine(
        dims: [usize; 4],
        voxel_size: [f64; 3],
        affine: [f64; 16],
        f: impl Fn(usize, usize, usize, usize) -> f64,
    ) -> Self {
        let mut image = Image::from_fn(dims, voxel_size, f);
        image.affine = affine;
        image
    }
}

fn scaled_identity(voxel_size: [f64; 3]) -> [f64; 16] {
    [
        voxel_size[0], 0.0, 0.0, 0.0,
        0.0, voxel_size[1], 0.0, 0.0,
        0.0, 0.0, voxel_size[2], 0.0,
        0.0, 0.0, 0.0, 1.0,
    ]
}

/// Get affine transformation matrix from header
fn get_affine(header: &NiftiHeader) -> [f64; 16] {
    // Prefer sform if available (sform_code > 0)
    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64,
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64,
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        scaled_identity([
            header.pixdim[1] as f64,
            header.pixdim[2] as f64,
            header.pixdim[3] as f64,
        ])
    }
}

/// Dimensions and voxel sizes from a NIfTI header, without loading voxels.
pub fn read_header(path: &Path) -> Result<([usize; 4], [f64; 3])> {
    let header = NiftiHeader::from_file(path).map_err(|e| nifti_error(path, e))?;
    Ok((header_dims(&header), header_voxel_size(&header)))
}

fn header_dims(header: &NiftiHeader) -> [usize; 4] {
    let ndim = header.dim[0] as usize;
    let get = |i: usize| {
        if i <= ndim {
            (header.dim[i] as usize).max(1)
        } else {
            1
        }
    };
    [get(1), get(2), get(3), get(4)]
}

fn header_voxel_size(header: &NiftiHeader) -> [f64; 3] {
    [
        header.pixdim[1] as f64,
        header.pixdim[2] as f64,
        header.pixdim[3] as f64,
    ]
}

fn nifti_error(path: &Path, e: impl std::fmt::Display) -> DwiError {
    DwiError::Nifti {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// Read a NIfTI file (.nii or .nii.gz), applying intensity scaling.
pub fn read_nifti(path: &Path) -> Result<Image> {
    if !path.exists() {
        return Err(DwiError::FileNotFound(path.to_path_buf()));
    }
    let obj = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| nifti_error(path, e))?;
    let header = obj.header().clone();
    let dims = header_dims(&header);
    let voxel_size = header_voxel_size(&header);
    let affine = get_affine(&header);

    let array = obj
        .into_volume()
        .into_ndarray::<f64>()
        .map_err(|e| nifti_error(path, e))?;

    // Reversed axes iterate with x fastest, i.e. Fortran order.
    let data: Vec<f64> = array.t().iter().copied().collect();
    let expected: usize = dims.iter().product();
    if data.len() != expected {
        return Err(nifti_error(
            path,
            format!("voxel count {} does not match dims {:?}", data.len(), dims),
        ));
    }

    Ok(Image {
        dims,
        voxel_size,
        affine,
        data,
    })
}

/// Encode an image as uncompressed NIfTI-1 float32 bytes.
pub fn encode_nifti(image: &Image) -> Result<Vec<u8>> {
    let [nx, ny, nz, nt] = image.dims;
    for &d in &image.dims {
        if d > i16::MAX as usize {
            return Err(DwiError::metadata(format!(
                "Dimension {} exceeds NIfTI-1 limit",
                d
            )));
        }
    }

    let mut header = [0u8; 348];
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    let ndim: i16 = if nt > 1 { 4 } else { 3 };
    let dim: [i16; 8] = [ndim, nx as i16, ny as i16, nz as i16, nt as i16, 1, 1, 1];
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype = 16 (FLOAT32), bitpix = 32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    let [vx, vy, vz] = image.voxel_size;
    let pixdim: [f32; 8] = [1.0, vx as f32, vy as f32, vz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // xyzt_units: mm and seconds
    header[123] = 2 | 8;

    header[254..256].copy_from_slice(&1i16.to_le_bytes());
    for row in 0..3 {
        for col in 0..4 {
            let offset = 280 + row * 16 + col * 4;
            header[offset..offset + 4]
                .copy_from_slice(&(image.affine[row * 4 + col] as f32).to_le_bytes());
        }
    }

    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(352 + image.data.len() * 4);
    buffer.write_all(&header)?;
    buffer.write_all(&[0u8; 4])?;
    for &val in &image.data {
        buffer.write_all(&(val as f32).to_le_bytes())?;
    }
    Ok(buffer)
}

/// Write a NIfTI file; gzip-compressed when the path ends in `.nii.gz`.
pub fn write_nifti(path: &Path, image: &Image) -> Result<()> {
    let bytes = encode_nifti(image)?;
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&bytes)?;
        encoder.finish()?
    } else {
        bytes
    };
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Locate `<base>.nii` or `<base>.nii.gz`.
pub fn find_nifti(base: &Path) -> Option<std::path::PathBuf> {
    ["nii", "nii.gz"]
        .iter()
        .map(|ext| {
            let mut s = base.as_os_str().to_os_string();
            s.push(".");
            s.push(ext);
            std::path::PathBuf::from(s)
        })
        .find(|p| p.exists())
}
