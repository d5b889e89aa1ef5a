//! Browser state as seen by the daemon. The host forwards tab and window notifications, and the
//! [TabRegistry] mirrors them so the monitor can answer lookups synchronously.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use tracing::trace;

pub type TabId = i64;
pub type WindowId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub id: TabId,
    pub window_id: WindowId,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub incognito: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowType {
    #[default]
    Normal,
    Popup,
    Panel,
    App,
    Devtools,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowState {
    #[default]
    Normal,
    Minimized,
    Maximized,
    Fullscreen,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowInfo {
    pub id: WindowId,
    #[serde(default)]
    pub focused: bool,
    #[serde(rename = "type", default)]
    pub window_type: WindowType,
    #[serde(default)]
    pub state: WindowState,
    #[serde(default)]
    pub incognito: bool,
}

impl WindowInfo {
    /// Only visible, regular browser windows accrue time.
    pub fn is_trackable(&self) -> bool {
        self.window_type == WindowType::Normal && self.state != WindowState::Minimized
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleState {
    Active,
    Idle,
    Locked,
}

impl IdleState {
    pub fn is_away(self) -> bool {
        !matches!(self, IdleState::Active)
    }
}

/// Notifications forwarded by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BrowserEvent {
    TabActivated {
        tab_id: TabId,
        window_id: WindowId,
    },
    TabUpdated {
        tab: TabInfo,
    },
    TabRemoved {
        tab_id: TabId,
        #[serde(default)]
        window_id: Option<WindowId>,
    },
    TabReplaced {
        added_tab_id: TabId,
        removed_tab_id: TabId,
    },
    /// `None` when no browser window has focus.
    WindowFocusChanged {
        window_id: Option<WindowId>,
    },
    WindowUpdated {
        window: WindowInfo,
    },
    WindowRemoved {
        window_id: WindowId,
    },
    IdleStateChanged {
        state: IdleState,
    },
}

/// Synchronous lookups the monitor needs while deciding a transition.
#[cfg_attr(test, mockall::automock)]
pub trait BrowserPort: Send + Sync {
    fn tab(&self, tab_id: TabId) -> Option<TabInfo>;

    fn active_tab(&self, window_id: WindowId) -> Option<TabInfo>;

    fn window(&self, window_id: WindowId) -> Option<WindowInfo>;

    fn focused_window(&self) -> Option<WindowInfo>;
}

#[derive(Default)]
struct RegistryState {
    tabs: HashMap<TabId, TabInfo>,
    windows: HashMap<WindowId, WindowInfo>,
    focused: Option<WindowId>,
}

impl RegistryState {
    fn activate(&mut self, tab_id: TabId, window_id: WindowId) {
        for tab in self.tabs.values_mut().filter(|t| t.window_id == window_id) {
            tab.active = tab.id == tab_id;
        }
        self.tabs.entry(tab_id).or_insert_with(|| TabInfo {
            id: tab_id,
            window_id,
            url: None,
            active: true,
            incognito: false,
        });
    }

    fn focus(&mut self, window_id: Option<WindowId>) {
        let window_id = window_id.filter(|id| *id >= 0);
        self.focused = window_id;
        for window in self.windows.values_mut() {
            window.focused = Some(window.id) == window_id;
        }
        if let Some(id) = window_id {
            self.windows.entry(id).or_insert_with(|| WindowInfo {
                id,
                focused: true,
                window_type: WindowType::Normal,
                state: WindowState::Normal,
                incognito: false,
            });
        }
    }
}

/// [BrowserPort] backed by the notifications seen so far.
#[derive(Default)]
pub struct TabRegistry {
    state: RwLock<RegistryState>,
}

impl TabRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces everything known with a full listing from the host.
    pub fn apply_snapshot(
        &self,
        windows: Vec<WindowInfo>,
        tabs: Vec<TabInfo>,
        focused_window: Option<WindowId>,
    ) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.windows = windows.into_iter().map(|w| (w.id, w)).collect();
        state.tabs = tabs.into_iter().map(|t| (t.id, t)).collect();
        let focused = focused_window.or_else(|| {
            state
                .windows
                .values()
                .find(|w| w.focused)
                .map(|w| w.id)
        });
        state.focus(focused);
        trace!(
            "Registry snapshot with {} windows and {} tabs",
            state.windows.len(),
            state.tabs.len()
        );
    }

    pub fn observe(&self, event: &BrowserEvent) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match event {
            BrowserEvent::TabActivated { tab_id, window_id } => state.activate(*tab_id, *window_id),
            BrowserEvent::TabUpdated { tab } => {
                let tab = tab.clone();
                if tab.active {
                    state.activate(tab.id, tab.window_id);
                }
                state.tabs.insert(tab.id, tab);
            }
            BrowserEvent::TabRemoved { tab_id, .. } => {
                state.tabs.remove(tab_id);
            }
            BrowserEvent::TabReplaced {
                added_tab_id,
                removed_tab_id,
            } => {
                if let Some(mut tab) = state.tabs.remove(removed_tab_id) {
                    tab.id = *added_tab_id;
                    let incoming = state.tabs.remove(added_tab_id);
                    if let Some(incoming) = incoming {
                        tab.url = incoming.url.or(tab.url);
                    }
                    state.tabs.insert(*added_tab_id, tab);
                }
            }
            BrowserEvent::WindowFocusChanged { window_id } => state.focus(*window_id),
            BrowserEvent::WindowUpdated { window } => {
                let mut window = window.clone();
                window.focused = state.focused == Some(window.id);
                state.windows.insert(window.id, window);
            }
            BrowserEvent::WindowRemoved { window_id } => {
                state.windows.remove(window_id);
                state.tabs.retain(|_, t| t.window_id != *window_id);
                if state.focused == Some(*window_id) {
                    state.focused = None;
                }
            }
            BrowserEvent::IdleStateChanged { .. } => {}
        }
    }
}

impl BrowserPort for TabRegistry {
    fn tab(&self, tab_id: TabId) -> Option<TabInfo> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.tabs.get(&tab_id).cloned()
    }

    fn active_tab(&self, window_id: WindowId) -> Option<TabInfo> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .tabs
            .values()
            .find(|t| t.window_id == window_id && t.active)
            .cloned()
    }

    fn window(&self, window_id: WindowId) -> Option<WindowInfo> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.windows.get(&window_id).cloned()
    }

    fn focused_window(&self) -> Option<WindowInfo> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.focused.and_then(|id| state.windows.get(&id).cloned())
    }
}

#[cfg(test)]
pub mod testing {
    use super::{TabInfo, WindowInfo, WindowState, WindowType};

    pub fn tab(id: i64, window_id: i64, url: &str) -> TabInfo {
        TabInfo {
            id,
            window_id,
            url: Some(url.to_string()),
            active: true,
            incognito: false,
        }
    }

    pub fn window(id: i64) -> WindowInfo {
        WindowInfo {
            id,
            focused: false,
            window_type: WindowType::Normal,
            state: WindowState::Normal,
            incognito: false,
        }
    }
}
