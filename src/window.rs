// Window context - the window plus the input state observed on it
//
// Owned by the host loop and passed to whoever needs it; there is no
// process-wide window or key table.

use anyhow::{Context, Result};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::collections::HashSet;
use std::sync::Arc;
use winit::event::{ElementState, MouseButton, WindowEvent};
use winit::event_loop::ActiveEventLoop;
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Fullscreen, Window, WindowAttributes};

use crate::config::WindowConfig;

/// Keys and buttons currently held, plus the last cursor position
#[derive(Debug, Default)]
pub struct InputState {
    keys_down: HashSet<KeyCode>,
    buttons_down: HashSet<MouseButton>,
    cursor: (f64, f64),
}

impl InputState {
    pub fn press_key(&mut self, key: KeyCode) -> bool {
        self.keys_down.insert(key)
    }

    pub fn release_key(&mut self, key: KeyCode) {
        self.keys_down.remove(&key);
    }

    pub fn is_key_down(&self, key: KeyCode) -> bool {
        self.keys_down.contains(&key)
    }

    pub fn press_button(&mut self, button: MouseButton) {
        self.buttons_down.insert(button);
    }

    pub fn release_button(&mut self, button: MouseButton) {
        self.buttons_down.remove(&button);
    }

    pub fn is_button_down(&self, button: MouseButton) -> bool {
        self.buttons_down.contains(&button)
    }

    pub fn set_cursor(&mut self, x: f64, y: f64) {
        self.cursor = (x, y);
    }

    pub fn cursor(&self) -> (f64, f64) {
        self.cursor
    }

    /// Focus loss means we will not see the matching release events
    pub fn clear(&mut self) {
        self.keys_down.clear();
        self.buttons_down.clear();
    }

    /// Update from a window event. Returns the key that just went down, if
    /// any (repeats are ignored).
    pub fn handle_event(&mut self, event: &WindowEvent) -> Option<KeyCode> {
        match event {
            WindowEvent::KeyboardInput { event, .. } => {
                let PhysicalKey::Code(key) = event.physical_key else {
                    return None;
                };
                match event.state {
                    ElementState::Pressed => self.press_key(key).then_some(key),
                    ElementState::Released => {
                        self.release_key(key);
                        None
                    }
                }
            }
            WindowEvent::MouseInput { state, button, .. } => {
                match state {
                    ElementState::Pressed => self.press_button(*button),
                    ElementState::Released => self.release_button(*button),
                }
                None
            }
            WindowEvent::CursorMoved { position, .. } => {
                self.set_cursor(position.x, position.y);
                None
            }
            WindowEvent::Focused(false) => {
                self.clear();
                None
            }
            _ => None,
        }
    }
}

pub struct WindowContext {
    window: Arc<Window>,
    pub input: InputState,
    fullscreen: bool,
}

impl WindowContext {
    pub fn new(event_loop: &ActiveEventLoop, config: &WindowConfig) -> Result<Self> {
        let mut attributes = WindowAttributes::default()
            .with_title(&config.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(config.width, config.height));

        if config.fullscreen {
            attributes = attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = event_loop
            .create_window(attributes)
            .context("Failed to create window")?;

        Ok(Self {
            window: Arc::new(window),
            input: InputState::default(),
            fullscreen: config.fullscreen,
        })
    }

    /// Drawable size in pixels; zero in either direction means minimized
    pub fn extent(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    pub fn raw_handles(&self) -> (RawDisplayHandle, RawWindowHandle) {
        (
            self.window.raw_display_handle(),
            self.window.raw_window_handle(),
        )
    }

    pub fn is_fullscreen(&self) -> bool {
        self.fullscreen
    }

    pub fn toggle_fullscreen(&mut self) {
        self.fullscreen = !self.fullscreen;

        if self.fullscreen {
            self.window
                .set_fullscreen(Some(Fullscreen::Borderless(None)));
            log::info!("Entered fullscreen mode");
        } else {
            self.window.set_fullscreen(None);
            log::info!("Exited fullscreen mode");
        }
    }

    pub fn set_title(&self, title: &str) {
        self.window.set_title(title);
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

/// Key name from config.toml to a physical key
pub fn parse_key(name: &str) -> Option<KeyCode> {
    let key = match name.trim().to_lowercase().as_str() {
        "escape" | "esc" => KeyCode::Escape,
        "space" => KeyCode::Space,
        "enter" | "return" => KeyCode::Enter,
        "tab" => KeyCode::Tab,
        "f1" => KeyCode::F1,
        "f2" => KeyCode::F2,
        "f3" => KeyCode::F3,
        "f4" => KeyCode::F4,
        "f5" => KeyCode::F5,
        "f6" => KeyCode::F6,
        "f7" => KeyCode::F7,
        "f8" => KeyCode::F8,
        "f9" => KeyCode::F9,
        "f10" => KeyCode::F10,
        "f11" => KeyCode::F11,
        "f12" => KeyCode::F12,
        "q" => KeyCode::KeyQ,
        "f" => KeyCode::KeyF,
        "r" => KeyCode::KeyR,
        _ => return None,
    };
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_names_parse_case_insensitively() {
        assert_eq!(parse_key("Escape"), Some(KeyCode::Escape));
        assert_eq!(parse_key(" esc "), Some(KeyCode::Escape));
        assert_eq!(parse_key("F11"), Some(KeyCode::F11));
        assert_eq!(parse_key("q"), Some(KeyCode::KeyQ));
        assert_eq!(parse_key("hyper"), None);
    }

    #[test]
    fn key_press_is_reported_once_until_released() {
        let mut input = InputState::default();

        assert!(input.press_key(KeyCode::Space));
        assert!(!input.press_key(KeyCode::Space));
        assert!(input.is_key_down(KeyCode::Space));

        input.release_key(KeyCode::Space);
        assert!(!input.is_key_down(KeyCode::Space));
        assert!(input.press_key(KeyCode::Space));
    }

    #[test]
    fn focus_loss_releases_everything() {
        let mut input = InputState::default();
        input.press_key(KeyCode::KeyF);
        input.press_button(MouseButton::Left);

        input.handle_event(&WindowEvent::Focused(false));

        assert!(!input.is_key_down(KeyCode::KeyF));
        assert!(!input.is_button_down(MouseButton::Left));
    }

    #[test]
    fn cursor_position_is_tracked() {
        let mut input = InputState::default();
        input.set_cursor(12.5, 40.0);
        assert_eq!(input.cursor(), (12.5, 40.0));
    }
}
