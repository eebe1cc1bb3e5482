// src/model/hooks.rs
// ============================================================================
// HOOKS - Registro explícito de observadores por capa
// ============================================================================
//
// Cada suscripción vive en una lista explícita. `InstrumentationScope` las
// retira en Drop, pase lo que pase durante la calibración.
//
// ============================================================================

use std::ops::{Deref, DerefMut};

use super::{Activation, CalibrationModel};

/// Callback invocado con la entrada de una capa
pub type Observer = Box<dyn FnMut(&Activation)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

struct Subscription {
    id: HookId,
    layer: String,
    observer: Observer,
}

/// Registro capa → observadores
#[derive(Default)]
pub struct HookRegistry {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, layer: &str, observer: Observer) -> HookId {
        let id = HookId(self.next_id);
        self.next_id += 1;
        self.subscriptions.push(Subscription {
            id,
            layer: layer.to_string(),
            observer,
        });
        id
    }

    /// Retira una suscripción. Devuelve false si ya no existía.
    pub fn detach(&mut self, id: HookId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != before
    }

    /// Retira todas las suscripciones
    pub fn drain(&mut self) -> usize {
        let n = self.subscriptions.len();
        self.subscriptions.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn is_attached(&self, layer: &str) -> bool {
        self.subscriptions.iter().any(|s| s.layer == layer)
    }

    /// Invoca los observadores suscritos a `layer`
    pub fn notify(&mut self, layer: &str, input: &Activation) {
        for sub in self.subscriptions.iter_mut().filter(|s| s.layer == layer) {
            (sub.observer)(input);
        }
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

/// Instrumentación con alcance: lo que se adjunta aquí se retira al salir
pub struct InstrumentationScope<'a, M: CalibrationModel + ?Sized> {
    model: &'a mut M,
    ids: Vec<HookId>,
}

impl<'a, M: CalibrationModel + ?Sized> InstrumentationScope<'a, M> {
    pub fn new(model: &'a mut M) -> Self {
        Self { model, ids: Vec::new() }
    }

    pub fn attach(&mut self, layer: &str, observer: Observer) -> HookId {
        let id = self.model.hooks_mut().attach(layer, observer);
        self.ids.push(id);
        id
    }

    pub fn active(&self) -> usize {
        self.ids.len()
    }
}

impl<M: CalibrationModel + ?Sized> Deref for InstrumentationScope<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        &*self.model
    }
}

impl<M: CalibrationModel + ?Sized> DerefMut for InstrumentationScope<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        &mut *self.model
    }
}

impl<M: CalibrationModel + ?Sized> Drop for InstrumentationScope<'_, M> {
    fn drop(&mut self) {
        let hooks = self.model.hooks_mut();
        for id in self.ids.drain(..) {
            hooks.detach(id);
        }
        log::debug!("Instrumentation detached ({} hooks remaining)", hooks.len());
    }
}
