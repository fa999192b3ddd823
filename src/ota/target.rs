// Flash write target backed by the ESP-IDF OTA and partition APIs

use core::ffi::c_void;

use esp_idf_sys::{
    esp, esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
    esp_ota_handle_t, esp_ota_set_boot_partition, esp_ota_write, esp_partition_erase_range,
    esp_partition_find_first, esp_partition_subtype_t,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_DATA_FAT,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_DATA_LITTLEFS,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_DATA_SPIFFS, esp_partition_t,
    esp_partition_type_t_ESP_PARTITION_TYPE_DATA, esp_partition_write, EspError,
    OTA_WITH_SEQUENTIAL_WRITES,
};
use uploader_core::{FlashError, FlashWriteTarget, Region};

/// Erase granularity of the SPI flash
const SECTOR_SIZE: usize = 4096;

/// Filesystem partition subtypes, in lookup order
const DATA_SUBTYPES: [esp_partition_subtype_t; 3] = [
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_DATA_LITTLEFS,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_DATA_SPIFFS,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_DATA_FAT,
];

enum OpenImage {
    App {
        partition: *const esp_partition_t,
        handle: esp_ota_handle_t,
        written: usize,
    },
    Data {
        partition: *const esp_partition_t,
        written: usize,
        erased_to: usize,
    },
}

pub struct EspFlashTarget {
    open: Option<OpenImage>,
    limit: Option<usize>,
    last_error: Option<String>,
}

// Partition pointers refer to the static partition table
unsafe impl Send for EspFlashTarget {}

impl EspFlashTarget {
    pub fn new() -> Self {
        Self {
            open: None,
            limit: None,
            last_error: None,
        }
    }

    fn partition(region: Region) -> Option<*const esp_partition_t> {
        let partition = match region {
            Region::Executable => unsafe { esp_ota_get_next_update_partition(core::ptr::null()) },
            Region::Data => DATA_SUBTYPES
                .iter()
                .map(|subtype| unsafe {
                    esp_partition_find_first(
                        esp_partition_type_t_ESP_PARTITION_TYPE_DATA,
                        *subtype,
                        core::ptr::null(),
                    )
                })
                .find(|p| !p.is_null())
                .unwrap_or(core::ptr::null()),
        };
        (!partition.is_null()).then_some(partition)
    }

    fn fail(&mut self, reason: impl Into<String>) -> FlashError {
        let reason = reason.into();
        self.last_error = Some(reason.clone());
        FlashError::new(reason)
    }

    fn fail_esp(&mut self, err: EspError) -> FlashError {
        self.fail(err.to_string())
    }
}

impl Default for EspFlashTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashWriteTarget for EspFlashTarget {
    fn capacity(&self, region: Region) -> Option<usize> {
        Self::partition(region).map(|p| unsafe { (*p).size as usize })
    }

    fn begin(&mut self, capacity: Option<usize>, region: Region) -> Result<(), FlashError> {
        if self.open.is_some() {
            return Err(self.fail("Update already running"));
        }
        let Some(partition) = Self::partition(region) else {
            return Err(self.fail(match region {
                Region::Executable => "No OTA partition available",
                Region::Data => "No filesystem partition found",
            }));
        };

        let size = unsafe { (*partition).size as usize };
        self.limit = Some(capacity.map_or(size, |c| c.min(size)));
        self.last_error = None;

        match region {
            Region::Executable => {
                let mut handle: esp_ota_handle_t = 0;
                let begun = esp!(unsafe {
                    esp_ota_begin(partition, OTA_WITH_SEQUENTIAL_WRITES as _, &mut handle as *mut _)
                });
                if let Err(e) = begun {
                    return Err(self.fail_esp(e));
                }
                self.open = Some(OpenImage::App {
                    partition,
                    handle,
                    written: 0,
                });
            }
            Region::Data => {
                self.open = Some(OpenImage::Data {
                    partition,
                    written: 0,
                    erased_to: 0,
                });
            }
        }

        log::info!("Flash target opened: {} region, {} bytes available", region, size);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let limit = self.limit.unwrap_or(usize::MAX);
        let result = match self.open.as_mut() {
            Some(open) => write_image(open, data, limit),
            None => Err("Update not started".to_string()),
        };

        match result {
            Ok(()) => data.len(),
            Err(reason) => {
                self.last_error = Some(reason);
                0
            }
        }
    }

    fn end(&mut self, _verify: bool) -> Result<(), FlashError> {
        let Some(open) = self.open.take() else {
            return Err(self.fail("Update not started"));
        };

        match open {
            OpenImage::App {
                partition,
                handle,
                written,
            } => {
                // esp_ota_end validates the image and frees the handle either way
                if let Err(e) = esp!(unsafe { esp_ota_end(handle) }) {
                    return Err(self.fail_esp(e));
                }
                if let Err(e) = esp!(unsafe { esp_ota_set_boot_partition(partition) }) {
                    return Err(self.fail_esp(e));
                }
                log::info!("Firmware image committed ({} bytes), boot partition updated", written);
            }
            OpenImage::Data { written, .. } => {
                if written == 0 {
                    return Err(self.fail("Nothing written"));
                }
                log::info!("Filesystem image committed ({} bytes)", written);
            }
        }
        Ok(())
    }

    fn abort(&mut self) {
        match self.open.take() {
            Some(OpenImage::App { handle, .. }) => {
                if let Err(e) = esp!(unsafe { esp_ota_abort(handle) }) {
                    log::warn!("esp_ota_abort failed: {}", e);
                }
            }
            Some(OpenImage::Data { written, .. }) => {
                log::warn!("Filesystem image abandoned after {} bytes", written);
            }
            None => {}
        }
    }

    fn last_error_reason(&self) -> Option<String> {
        self.last_error.clone()
    }
}

fn write_image(open: &mut OpenImage, data: &[u8], limit: usize) -> Result<(), String> {
    match open {
        OpenImage::App { handle, written, .. } => {
            if *written + data.len() > limit {
                return Err("Not enough space".to_string());
            }
            esp!(unsafe { esp_ota_write(*handle, data.as_ptr() as *const c_void, data.len() as _) })
                .map_err(|e| e.to_string())?;
            *written += data.len();
        }
        OpenImage::Data {
            partition,
            written,
            erased_to,
        } => {
            let end = *written + data.len();
            if end > limit {
                return Err("Not enough space".to_string());
            }

            // Erase whole sectors ahead of the data
            if end > *erased_to {
                let erase_len = (end - *erased_to).div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
                esp!(unsafe { esp_partition_erase_range(*partition, *erased_to as _, erase_len as _) })
                    .map_err(|e| e.to_string())?;
                *erased_to += erase_len;
            }

            esp!(unsafe {
                esp_partition_write(*partition, *written as _, data.as_ptr() as *const c_void, data.len() as _)
            })
            .map_err(|e| e.to_string())?;
            *written = end;
        }
    }
    Ok(())
}
