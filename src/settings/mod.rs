use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::image::ViewFlags;
use crate::sorting::{SortField, SortOrder};

mod error;

pub use error::{SettingsError, SettingsErrorCode, SettingsResult};

fn map_io(
    fallback: SettingsErrorCode,
    context: impl FnOnce() -> String,
) -> impl FnOnce(std::io::Error) -> SettingsError {
    move |error| SettingsError::from_io_error(fallback, context(), error)
}

fn map_sqlite(
    fallback: SettingsErrorCode,
    context: impl FnOnce() -> String,
) -> impl FnOnce(rusqlite::Error) -> SettingsError {
    move |error| SettingsError::from_sqlite_error(fallback, context(), error)
}

/// Window geometry as persisted by the embedding application. The core only
/// round-trips it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct WindowGeometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub maximized: bool,
}

/// Sqlite-backed key/value store for the state the core consumes: last
/// directory, view flags, sort fields/orders, icon height, view mode and
/// window geometry.
pub struct Settings {
    conn: Connection,
}

impl Settings {
    /// Opens (and if necessary creates) the settings database below `dir`.
    pub fn open_in(dir: &Path) -> SettingsResult<Self> {
        std::fs::create_dir_all(dir).map_err(map_io(SettingsErrorCode::DataDirUnavailable, || {
            "Failed to create data dir".to_string()
        }))?;
        Self::open_file(&dir.join("proofsheet.db"))
    }

    pub fn open_file(path: &Path) -> SettingsResult<Self> {
        let conn = Connection::open(path).map_err(map_sqlite(SettingsErrorCode::OpenFailed, || {
            "Failed to open settings db".to_string()
        }))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .map_err(map_sqlite(SettingsErrorCode::SchemaInitFailed, || {
            "Failed to init schema".to_string()
        }))?;
        Ok(Self { conn })
    }

    fn get_string(&self, key: &str) -> SettingsResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row: &Row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(map_sqlite(SettingsErrorCode::ReadFailed, || {
                format!("Failed to read setting {key}")
            }))
    }

    fn set_string(&self, key: &str, value: &str) -> SettingsResult<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(map_sqlite(SettingsErrorCode::WriteFailed, || {
                format!("Failed to store setting {key}")
            }))?;
        Ok(())
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, key: &str) -> SettingsResult<Option<T>> {
        match self.get_string(key)? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                SettingsError::new(
                    SettingsErrorCode::ParseFailed,
                    format!("Failed to parse setting {key}: {e}"),
                )
            }),
        }
    }

    fn set_json<T: Serialize>(&self, key: &str, value: &T) -> SettingsResult<()> {
        let raw = serde_json::to_string(value).map_err(|e| {
            SettingsError::new(
                SettingsErrorCode::SerializeFailed,
                format!("Failed to serialize setting {key}: {e}"),
            )
        })?;
        self.set_string(key, &raw)
    }

    pub fn last_directory(&self) -> SettingsResult<Option<PathBuf>> {
        Ok(self.get_string("lastDirectory")?.map(PathBuf::from))
    }

    pub fn set_last_directory(&self, dir: &Path) -> SettingsResult<()> {
        self.set_string("lastDirectory", &dir.to_string_lossy())
    }

    pub fn view_flags(&self) -> SettingsResult<ViewFlags> {
        Ok(self
            .get_json::<u32>("viewFlags")?
            .map(ViewFlags::from_bits_truncate)
            .unwrap_or_default())
    }

    pub fn set_view_flags(&self, flags: ViewFlags) -> SettingsResult<()> {
        self.set_json("viewFlags", &flags.bits())
    }

    pub fn view_mode(&self) -> SettingsResult<Option<String>> {
        self.get_string("viewMode")
    }

    pub fn set_view_mode(&self, mode: &str) -> SettingsResult<()> {
        self.set_string("viewMode", mode)
    }

    pub fn image_sort(&self) -> SettingsResult<(SortField, SortOrder)> {
        Ok(self
            .get_json("imageSort")?
            .unwrap_or((SortField::FileName, SortOrder::Ascending)))
    }

    pub fn set_image_sort(&self, field: SortField, order: SortOrder) -> SettingsResult<()> {
        self.set_json("imageSort", &(field, order))
    }

    pub fn section_sort(&self) -> SettingsResult<(SortField, SortOrder)> {
        Ok(self
            .get_json("sectionSort")?
            .unwrap_or((SortField::None, SortOrder::Ascending)))
    }

    pub fn set_section_sort(&self, field: SortField, order: SortOrder) -> SettingsResult<()> {
        self.set_json("sectionSort", &(field, order))
    }

    pub fn icon_height(&self) -> SettingsResult<u32> {
        Ok(self.get_json::<u32>("iconHeight")?.unwrap_or(150).clamp(16, 512))
    }

    pub fn set_icon_height(&self, height: u32) -> SettingsResult<()> {
        self.set_json("iconHeight", &height)
    }

    pub fn window_geometry(&self) -> SettingsResult<Option<WindowGeometry>> {
        self.get_json("windowGeometry")
    }

    pub fn set_window_geometry(&self, geometry: &WindowGeometry) -> SettingsResult<()> {
        self.set_json("windowGeometry", geometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn uniq_dir(label: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_nanos();
        std::env::temp_dir().join(format!("proofsheet-settings-{label}-{ts}"))
    }

    #[test]
    fn round_trips_core_settings() {
        let dir = uniq_dir("roundtrip");
        let settings = Settings::open_in(&dir).unwrap();

        assert_eq!(settings.last_directory().unwrap(), None);
        settings.set_last_directory(Path::new("/photos/2022")).unwrap();
        assert_eq!(
            settings.last_directory().unwrap(),
            Some(PathBuf::from("/photos/2022"))
        );

        settings
            .set_image_sort(SortField::DateRecorded, SortOrder::Descending)
            .unwrap();
        assert_eq!(
            settings.image_sort().unwrap(),
            (SortField::DateRecorded, SortOrder::Descending)
        );

        settings.set_view_flags(ViewFlags::COMBINE_RAW_JPEG).unwrap();
        assert_eq!(settings.view_flags().unwrap(), ViewFlags::COMBINE_RAW_JPEG);

        settings.set_icon_height(200).unwrap();
        assert_eq!(settings.icon_height().unwrap(), 200);

        let geo = WindowGeometry {
            x: 10,
            y: 20,
            width: 1280,
            height: 720,
            maximized: false,
        };
        settings.set_window_geometry(&geo).unwrap();
        assert_eq!(settings.window_geometry().unwrap(), Some(geo));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn defaults_apply_when_unset() {
        let dir = uniq_dir("defaults");
        let settings = Settings::open_in(&dir).unwrap();
        assert_eq!(
            settings.image_sort().unwrap(),
            (SortField::FileName, SortOrder::Ascending)
        );
        assert_eq!(settings.icon_height().unwrap(), 150);
        assert_eq!(settings.view_flags().unwrap(), ViewFlags::default());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
