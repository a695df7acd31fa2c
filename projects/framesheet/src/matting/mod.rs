// Background removal collaborator: given a frame, return it with an alpha matte.

pub mod rembg;

use anyhow::{anyhow, Result};
use image::RgbaImage;
use std::sync::{Arc, Mutex, MutexGuard};

/// Thresholds forwarded to the matting model, derived from `matte_strength`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatteSettings {
    /// Foreground confidence threshold, rises with strength
    pub foreground_threshold: u8,
    /// Background confidence threshold, falls with strength
    pub background_threshold: u8,
    /// Edge refinement, only above the midpoint
    pub alpha_matting: bool,
}

impl MatteSettings {
    pub fn from_strength(strength: f32) -> Self {
        let s = strength.clamp(0.0, 1.0);
        Self {
            foreground_threshold: (240.0 * s).floor() as u8,
            background_threshold: (10.0 * (1.0 - s)).floor() as u8,
            alpha_matting: s > 0.5,
        }
    }
}

/// A loaded matting model. Not assumed to be safe for concurrent calls:
/// every call takes `&mut self`.
pub trait Matter: Send {
    fn matte(&mut self, frame: &RgbaImage, settings: &MatteSettings) -> Result<RgbaImage>;
}

/// Creates matting sessions; one per worker thread or one per process.
pub trait MattingProvider: Send + Sync {
    fn create_session(&self) -> Result<Box<dyn Matter>>;
}

/// Process-wide session handle. The session is created on first use (or by
/// `ensure_ready`) and every call is serialized through the mutex, so clones
/// can be handed to any number of background jobs.
#[derive(Clone)]
pub struct SharedMatter {
    provider: Arc<dyn MattingProvider>,
    session: Arc<Mutex<Option<Box<dyn Matter>>>>,
}

impl SharedMatter {
    pub fn new(provider: Arc<dyn MattingProvider>) -> Self {
        Self {
            provider,
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// A poisoned lock drops the session and starts clean.
    fn lock_session(&self) -> MutexGuard<'_, Option<Box<dyn Matter>>> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Matting session poisoned by a panic, recreating it");
                let mut guard = poisoned.into_inner();
                *guard = None;
                self.session.clear_poison();
                guard
            }
        }
    }

    fn ready_session<'a>(
        &self,
        guard: &'a mut MutexGuard<'_, Option<Box<dyn Matter>>>,
    ) -> Result<&'a mut Box<dyn Matter>> {
        if guard.is_none() {
            **guard = Some(self.provider.create_session()?);
            tracing::info!("Matting session initialized");
        }
        (**guard)
            .as_mut()
            .ok_or_else(|| anyhow!("Matting session unavailable"))
    }

    /// Load the session now instead of on the first frame.
    pub fn ensure_ready(&self) -> Result<()> {
        let mut guard = self.lock_session();
        self.ready_session(&mut guard)?;
        Ok(())
    }
}

impl Matter for SharedMatter {
    fn matte(&mut self, frame: &RgbaImage, settings: &MatteSettings) -> Result<RgbaImage> {
        let mut guard = self.lock_session();
        self.ready_session(&mut guard)?.matte(frame, settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{KeyWhiteProvider, PanicOnceProvider};
    use std::sync::atomic::Ordering;

    #[test]
    fn test_thresholds_are_monotonic() {
        let mut prev = MatteSettings::from_strength(0.0);
        assert_eq!(prev.foreground_threshold, 0);
        assert_eq!(prev.background_threshold, 10);
        for step in 1..=100 {
            let next = MatteSettings::from_strength(step as f32 / 100.0);
            assert!(next.foreground_threshold >= prev.foreground_threshold);
            assert!(next.background_threshold <= prev.background_threshold);
            prev = next;
        }
        assert_eq!(prev.foreground_threshold, 240);
        assert_eq!(prev.background_threshold, 0);
    }

    #[test]
    fn test_refinement_only_above_midpoint() {
        assert!(!MatteSettings::from_strength(0.5).alpha_matting);
        assert!(MatteSettings::from_strength(0.51).alpha_matting);
        assert_eq!(MatteSettings::from_strength(0.6).foreground_threshold, 144);
    }

    #[test]
    fn test_shared_session_created_once() {
        let provider = Arc::new(KeyWhiteProvider::default());
        let shared = SharedMatter::new(provider.clone());
        assert_eq!(provider.created.load(Ordering::SeqCst), 0);

        let frame = RgbaImage::from_pixel(2, 2, image::Rgba([255, 255, 255, 255]));
        let settings = MatteSettings::from_strength(0.6);
        let mut a = shared.clone();
        let mut b = shared.clone();
        a.matte(&frame, &settings).unwrap();
        b.matte(&frame, &settings).unwrap();
        shared.ensure_ready().unwrap();

        assert_eq!(provider.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_mid_call_recreates_session() {
        let provider = Arc::new(PanicOnceProvider::default());
        let shared = SharedMatter::new(provider.clone());
        let frame = RgbaImage::from_pixel(2, 2, image::Rgba([255, 255, 255, 255]));
        let settings = MatteSettings::from_strength(0.6);

        let mut first = shared.clone();
        let outcome = std::thread::spawn(move || first.matte(&frame, &settings).map(|_| ())).join();
        assert!(outcome.is_err());

        let frame = RgbaImage::from_pixel(2, 2, image::Rgba([255, 255, 255, 255]));
        let mut second = shared.clone();
        let matted = second.matte(&frame, &settings).unwrap();
        assert_eq!(matted.get_pixel(0, 0)[3], 0);
        assert_eq!(provider.created.load(Ordering::SeqCst), 2);
    }
}
