//! Post-effect ping-pong
//!
//! The scene renders into texture A. Effect `i` samples `[A, B][i % 2]` and
//! writes `[A, B][(i + 1) % 2]`, except the last effect which writes the real
//! destination.

use crate::backend::GraphicsBackend;
use crate::error::RenderResult;
use crate::render_target::{RenderTexture, RenderTextureDescriptor};
use crate::RendererConfig;

/// Source and destination of one post effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPongStep {
    /// Index into the A/B pair
    pub source: usize,
    /// Index into the A/B pair, `None` for the final destination
    pub destination: Option<usize>,
}

/// Steps for `effect_count` post effects.
pub fn schedule(effect_count: usize) -> Vec<PingPongStep> {
    (0..effect_count)
        .map(|i| PingPongStep {
            source: i % 2,
            destination: (i + 1 < effect_count).then_some((i + 1) % 2),
        })
        .collect()
}

/// Make sure `slot` holds an A/B pair of `width` x `height`, recreating it
/// when the size changed.
pub(crate) fn ensure_textures<B: GraphicsBackend>(
    backend: &mut B,
    slot: &mut Option<[RenderTexture; 2]>,
    width: u32,
    height: u32,
    config: &RendererConfig,
) -> RenderResult<()> {
    if let Some(pair) = slot {
        if pair[0].width() == width && pair[0].height() == height {
            return Ok(());
        }
        log::debug!("Post effect textures resized to {}x{}", width, height);
        for texture in pair.iter_mut() {
            texture.destroy(backend);
        }
        *slot = None;
    }

    let make = |backend: &mut B, label: &str| {
        RenderTexture::new(
            backend,
            RenderTextureDescriptor::color(label, width, height)
                .with_samples(config.msaa_samples)
                .with_stencil(config.use_stencil),
        )
    };
    let a = make(backend, "post effect A")?;
    let b = make(backend, "post effect B")?;
    *slot = Some([a, b]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;

    #[test]
    fn test_schedule_alternates_without_aliasing() {
        let steps = schedule(3);
        assert_eq!(
            steps,
            vec![
                PingPongStep { source: 0, destination: Some(1) },
                PingPongStep { source: 1, destination: Some(0) },
                PingPongStep { source: 0, destination: None },
            ]
        );
        for step in &steps {
            assert_ne!(Some(step.source), step.destination);
        }
    }

    #[test]
    fn test_single_effect_reads_scene_and_writes_destination() {
        assert_eq!(
            schedule(1),
            vec![PingPongStep { source: 0, destination: None }]
        );
        assert!(schedule(0).is_empty());
    }

    #[test]
    fn test_textures_recreated_on_resize() {
        let mut backend = DummyBackend::new();
        let config = RendererConfig::default();
        let mut slot = None;
        ensure_textures(&mut backend, &mut slot, 64, 32, &config).unwrap();
        let first = slot.as_ref().unwrap()[0].framebuffer();

        ensure_textures(&mut backend, &mut slot, 64, 32, &config).unwrap();
        assert_eq!(slot.as_ref().unwrap()[0].framebuffer(), first);

        ensure_textures(&mut backend, &mut slot, 128, 128, &config).unwrap();
        let pair = slot.as_ref().unwrap();
        assert_ne!(pair[0].framebuffer(), first);
        assert_eq!(pair[1].width(), 128);
    }
}
