//! Per-AOI session directories.

use std::path::{Path, PathBuf};
use terrasight_dem::CLIPPED_DEM_FILE;

/// Root of every AOI's working directory, `{data_dir}/sessions`.
#[derive(Debug, Clone)]
pub struct SessionLayout {
    root: PathBuf,
}

impl SessionLayout {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            root: data_dir.as_ref().join("sessions"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, aoi_id: &str) -> PathBuf {
        self.root.join(aoi_id)
    }

    /// Names the elevation file may have, newest convention first.
    pub fn elevation_candidates(aoi_id: &str) -> [String; 4] {
        [
            CLIPPED_DEM_FILE.to_string(),
            format!("{}_srtm.tif", aoi_id),
            "clipped_srtm.tif".to_string(),
            format!("{}_dem.tif", aoi_id),
        ]
    }

    /// First existing elevation file in the AOI's session directory.
    pub fn find_elevation(&self, aoi_id: &str) -> Option<PathBuf> {
        let dir = self.session_dir(aoi_id);
        Self::elevation_candidates(aoi_id)
            .into_iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_elevation_lookup_order() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(tmp.path());
        let dir = layout.session_dir("lot7");
        assert_eq!(dir, tmp.path().join("sessions").join("lot7"));
        fs::create_dir_all(&dir).unwrap();

        assert!(layout.find_elevation("lot7").is_none());

        fs::write(dir.join("lot7_dem.tif"), b"x").unwrap();
        assert_eq!(layout.find_elevation("lot7").unwrap(), dir.join("lot7_dem.tif"));

        fs::write(dir.join("clipped_srtm.tif"), b"x").unwrap();
        assert_eq!(layout.find_elevation("lot7").unwrap(), dir.join("clipped_srtm.tif"));

        fs::write(dir.join("lot7_srtm.tif"), b"x").unwrap();
        assert_eq!(layout.find_elevation("lot7").unwrap(), dir.join("lot7_srtm.tif"));

        fs::write(dir.join(CLIPPED_DEM_FILE), b"x").unwrap();
        assert_eq!(layout.find_elevation("lot7").unwrap(), dir.join(CLIPPED_DEM_FILE));
    }
}
