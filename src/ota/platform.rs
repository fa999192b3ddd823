use uploader_core::Platform;

/// Restart and heap queries on the running chip
pub struct EspPlatform;

impl Platform for EspPlatform {
    fn restart(&mut self) {
        log::info!("Restarting system...");
        unsafe { esp_idf_sys::esp_restart() };
    }

    fn free_heap(&self) -> Option<usize> {
        Some(unsafe { esp_idf_sys::esp_get_free_heap_size() } as usize)
    }
}
