// Shader hot-reload
//
// Watches the shader directory on notify's background thread. Events travel
// over a channel that the event loop drains once per frame.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::mpsc::{self, Receiver};

pub struct ShaderWatcher {
    // Stops watching when dropped
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
}

impl ShaderWatcher {
    pub fn new(directory: &Path) -> Result<Self> {
        let (tx, events) = mpsc::channel();

        let mut watcher = notify::recommended_watcher(tx)
            .context("Failed to create shader watcher")?;
        watcher
            .watch(directory, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", directory))?;

        log::info!("Watching {:?} for shader changes", directory);

        Ok(Self {
            _watcher: watcher,
            events,
        })
    }

    /// Drain pending events; true when a compiled shader changed
    pub fn poll(&self) -> bool {
        let mut changed = false;
        for event in self.events.try_iter() {
            match event {
                Ok(event) if is_shader_change(&event) => {
                    log::debug!("Shader change: {:?}", event.paths);
                    changed = true;
                }
                Ok(_) => {}
                Err(e) => log::warn!("Shader watcher error: {}", e),
            }
        }
        changed
    }
}

/// A write or create touching at least one `.spv` file
pub fn is_shader_change(event: &Event) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|path| path.extension().is_some_and(|ext| ext == "spv"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind};
    use std::path::PathBuf;

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn spirv_writes_trigger_reload() {
        let modify = EventKind::Modify(ModifyKind::Data(DataChange::Content));
        assert!(is_shader_change(&event(modify, "shaders/cube.vert.spv")));
        assert!(is_shader_change(&event(
            EventKind::Create(CreateKind::File),
            "shaders/cube.frag.spv"
        )));
    }

    #[test]
    fn other_files_and_removals_are_ignored() {
        let modify = EventKind::Modify(ModifyKind::Data(DataChange::Content));
        assert!(!is_shader_change(&event(modify, "shaders/cube.vert")));
        assert!(!is_shader_change(&event(
            EventKind::Remove(RemoveKind::File),
            "shaders/cube.vert.spv"
        )));
    }
}
