//! Source image identity and storage role resolution

use kpve_common::crd::ImageSource;
use kpve_common::hash::sha256_hex;
use kpve_common::Error;
use kpve_pve::{CapacityProvider, StorageInfo};

/// Content type of storages holding downloaded disk images
pub const IMPORT_CONTENT: &str = "import";

/// Content type of storages holding VM disks
pub const IMAGES_CONTENT: &str = "images";

/// Disk formats the import content type accepts
const IMPORT_FORMATS: &[&str] = &["qcow2", "raw", "vmdk"];

/// File name of a class's source image on import storage
///
/// Derived from the class name and the image URL and checksum, so a changed
/// source yields a different name and never silently replaces the old image.
pub fn image_file_name(class: &str, image: &ImageSource) -> String {
    let ext = image
        .url
        .rsplit('/')
        .next()
        .and_then(|file| file.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| IMPORT_FORMATS.contains(&ext.as_str()))
        .unwrap_or_else(|| "qcow2".to_string());

    let source = format!(
        "{}|{}",
        image.url,
        image.checksum.as_deref().unwrap_or_default()
    );
    let digest = sha256_hex(source.as_bytes());

    format!("{}-{}.{}", class, &digest[..10], ext)
}

/// Volume id of an image file on an import storage
pub fn import_volume(storage: &str, file: &str) -> String {
    format!("{}:{}/{}", storage, IMPORT_CONTENT, file)
}

/// Storages a class installs through in one region
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageRoles {
    /// Storage receiving the downloaded image
    pub import: StorageInfo,
    /// Storage holding the template VM's disks
    pub images: StorageInfo,
    /// Zones to install a template VM in
    pub zones: Vec<String>,
}

/// Pick the import and images storages from a class's storage list
///
/// Both roles may be served by the same storage. Target zones are those that
/// reach both storages. A shared images storage needs only one template VM,
/// so the target collapses to the first zone.
pub fn resolve_storage_roles(
    capacity: &dyn CapacityProvider,
    region: &str,
    storage_ids: &[String],
) -> Result<StorageRoles, Error> {
    let storages: Vec<StorageInfo> = storage_ids
        .iter()
        .filter_map(|id| capacity.get_storage(region, id))
        .filter(|s| !s.zones.is_empty())
        .collect();

    let find = |content: &str| {
        storages
            .iter()
            .find(|s| s.supports(content))
            .cloned()
            .ok_or_else(|| {
                Error::configuration(
                    format!("region {}", region),
                    format!(
                        "none of the storages [{}] supports '{}' content",
                        storage_ids.join(", "),
                        content
                    ),
                )
            })
    };
    let import = find(IMPORT_CONTENT)?;
    let images = find(IMAGES_CONTENT)?;

    let mut zones: Vec<String> = images
        .zones
        .iter()
        .filter(|z| import.zones.contains(z))
        .cloned()
        .collect();
    if zones.is_empty() {
        return Err(Error::configuration(
            format!("region {}", region),
            format!(
                "storages {} and {} share no zone",
                import.id, images.id
            ),
        ));
    }
    if images.shared {
        zones.truncate(1);
    }

    Ok(StorageRoles {
        import,
        images,
        zones,
    })
}

/// Storages among `storage_ids` that can hold images for `zone`
pub fn import_storages_in_zone(
    capacity: &dyn CapacityProvider,
    region: &str,
    zone: &str,
    storage_ids: &[String],
) -> Vec<String> {
    storage_ids
        .iter()
        .filter_map(|id| capacity.get_storage(region, id))
        .filter(|s| s.supports(IMPORT_CONTENT) && s.zones.iter().any(|z| z == zone))
        .map(|s| s.id)
        .collect()
}
