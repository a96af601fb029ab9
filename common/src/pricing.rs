//! Precio estimado de un job y tope de `max_price` por job.
//!
//! El precio depende de los recursos pedidos durante el timeout del job, de la prioridad
//! de la tarea y de la reputación del worker: un worker con mejor historial cobra menos.

use crate::task::{Priority, ResourceRequirements};

/// Precio por hora de una CPU completa.
pub const BASE_CPU_PRICE: f64 = 0.01;
/// Precio por hora de una GPU completa.
pub const BASE_GPU_PRICE: f64 = 0.05;
/// Precio por hora de cada GB de RAM.
pub const BASE_RAM_PRICE: f64 = 0.02;

/// Multiplicador más barato posible (reputación excelente).
pub const BEST_REPUTATION_MULTIPLIER: f64 = 0.8;

pub fn urgency_multiplier(priority: Priority) -> f64 {
    match priority {
        Priority::Low => 0.8,
        Priority::Normal => 1.0,
        Priority::High => 1.5,
    }
}

/// `score` en [0, 1], como lo devuelve el almacén de reputación.
pub fn reputation_multiplier(score: f64) -> f64 {
    if score >= 0.9 {
        BEST_REPUTATION_MULTIPLIER
    } else if score >= 0.7 {
        0.9
    } else if score >= 0.5 {
        1.0
    } else if score >= 0.3 {
        1.2
    } else {
        1.5
    }
}

/// Coste base de los recursos durante todo el timeout, sin multiplicadores.
pub fn resource_cost(req: &ResourceRequirements) -> f64 {
    let hours = req.timeout_seconds as f64 / 3600.0;
    let per_hour = req.cpu_percent / 100.0 * BASE_CPU_PRICE
        + req.gpu_percent / 100.0 * BASE_GPU_PRICE
        + req.ram_gb * BASE_RAM_PRICE;
    per_hour * hours
}

/// Precio de un job en un worker con esa reputación.
pub fn job_quote(req: &ResourceRequirements, priority: Priority, reputation: f64) -> f64 {
    resource_cost(req) * urgency_multiplier(priority) * reputation_multiplier(reputation)
}

/// Tope de precio por job de una tarea.
#[derive(Debug, Clone, PartialEq)]
pub struct Budget {
    pub requirements: ResourceRequirements,
    pub priority: Priority,
    pub max_price: f64,
}

impl Budget {
    pub fn unlimited() -> Self {
        Self {
            requirements: ResourceRequirements::default(),
            priority: Priority::Normal,
            max_price: f64::INFINITY,
        }
    }

    /// Un worker con esta reputación entra en el presupuesto.
    pub fn admits(&self, reputation: f64) -> bool {
        job_quote(&self.requirements, self.priority, reputation) <= self.max_price
    }

    /// Precio más bajo que cualquier worker podría cobrar.
    pub fn floor(&self) -> f64 {
        resource_cost(&self.requirements) * urgency_multiplier(self.priority) * BEST_REPUTATION_MULTIPLIER
    }
}
