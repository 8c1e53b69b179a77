use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use enigo::{Axis, Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};
use tokio::task;
use xcap::Monitor;

use crate::engine::{ControlKey, Frame, InputDriver, ScreenSource};

fn primary_monitor() -> Result<Monitor> {
    let monitors = Monitor::all().map_err(|e| anyhow!("monitor enumeration failed: {e}"))?;
    let index = monitors.iter().position(|m| m.is_primary()).unwrap_or(0);
    monitors
        .into_iter()
        .nth(index)
        .ok_or_else(|| anyhow!("no monitor available"))
}

/// Primary-monitor capture backed by xcap. The grab is a blocking OS call,
/// so it runs on the blocking pool.
pub struct NativeScreen;

impl NativeScreen {
    pub fn new() -> Self {
        Self
    }

    fn grab() -> Result<Frame> {
        let monitor = primary_monitor()?;
        let image = monitor
            .capture_image()
            .map_err(|e| anyhow!("screen capture failed: {e}"))?;
        Ok(Frame::new(image))
    }
}

impl Default for NativeScreen {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScreenSource for NativeScreen {
    async fn capture(&self) -> Result<Frame> {
        task::spawn_blocking(Self::grab).await.context("capture task panicked")?
    }
}

/// Converts the engine's scroll convention (positive = up) into wheel lines
/// for enigo, whose vertical axis treats positive as down.
pub(crate) fn scroll_lines(amount: i64) -> i32 {
    let clamped = amount.clamp(i64::from(i32::MIN) + 1, i64::from(i32::MAX)) as i32;
    -clamped
}

/// Synthetic mouse/keyboard driver backed by enigo. A fresh handle is created
/// per injection inside `spawn_blocking`: the platform handles behind enigo
/// are not `Send`.
pub struct NativeInput {
    width: u32,
    height: u32,
}

impl NativeInput {
    pub fn new() -> Result<Self> {
        let monitor = primary_monitor()?;
        Ok(Self { width: monitor.width(), height: monitor.height() })
    }

    async fn inject<F>(op: F) -> Result<()>
    where
        F: FnOnce(&mut Enigo) -> Result<()> + Send + 'static,
    {
        task::spawn_blocking(move || {
            let mut enigo = Enigo::new(&Settings::default())
                .map_err(|e| anyhow!("input driver init failed: {e:?}"))?;
            op(&mut enigo)
        })
        .await
        .context("input task panicked")?
    }

    fn map_key(key: ControlKey) -> Key {
        match key {
            ControlKey::Enter => Key::Return,
            ControlKey::Tab => Key::Tab,
            ControlKey::Backspace => Key::Backspace,
        }
    }
}

#[async_trait]
impl InputDriver for NativeInput {
    async fn click(&self, x: i32, y: i32) -> Result<()> {
        Self::inject(move |enigo| {
            enigo.move_mouse(x, y, Coordinate::Abs).map_err(|e| anyhow!("{e:?}"))?;
            enigo.button(Button::Left, Direction::Click).map_err(|e| anyhow!("{e:?}"))
        })
        .await
    }

    async fn double_click(&self, x: i32, y: i32) -> Result<()> {
        Self::inject(move |enigo| {
            enigo.move_mouse(x, y, Coordinate::Abs).map_err(|e| anyhow!("{e:?}"))?;
            enigo.button(Button::Left, Direction::Click).map_err(|e| anyhow!("{e:?}"))?;
            enigo.button(Button::Left, Direction::Click).map_err(|e| anyhow!("{e:?}"))
        })
        .await
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        let text = text.to_string();
        Self::inject(move |enigo| enigo.text(&text).map_err(|e| anyhow!("typing failed: {e:?}")))
            .await
    }

    async fn key_press(&self, key: ControlKey) -> Result<()> {
        let key = Self::map_key(key);
        Self::inject(move |enigo| {
            enigo.key(key, Direction::Click).map_err(|e| anyhow!("key press failed: {e:?}"))
        })
        .await
    }

    async fn scroll(&self, amount: i64) -> Result<()> {
        let lines = scroll_lines(amount);
        Self::inject(move |enigo| {
            enigo.scroll(lines, Axis::Vertical).map_err(|e| anyhow!("scroll failed: {e:?}"))
        })
        .await
    }

    fn screen_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
