//! # rw-surrogate
//!
//! Freeze-Thaw multi-fidelity surrogate for Rungwise.
//!
//! Learning curves are modelled as `f(x, r) = g(x) + h_x(r)`: a Matérn-5/2 GP
//! over configurations plus an independent exponential-decay GP over
//! resources per configuration. Kernel hyperparameters are marginalized with
//! a pool of slice-sampling draws, in-flight trials are completed by
//! fantasies, and candidates are scored by expected improvement averaged over
//! the pool.

pub mod acquisition;
pub mod grid;
pub mod hyper;
pub mod kernel;
pub mod likelihood;
pub mod linalg;
pub mod mcmc;
pub mod model;
mod surrogate;

pub use acquisition::{
    expected_improvement, mixture_expected_improvement, AcquisitionConfig, Candidate,
    CandidateSelector,
};
pub use grid::ResourceGrid;
pub use hyper::Hyperparameters;
pub use kernel::Kernel;
pub use likelihood::{
    logdet_cholfact, precompute, resource_kernel_likelihood_computations,
    resource_kernel_likelihood_slow_computations, Precomputed, ResourceLikelihood,
};
pub use mcmc::SliceSampler;
pub use model::{CurveData, LatentPrediction, PosteriorState, TrainingData};
pub use surrogate::{
    FitDiagnostics, Gaussian, PendingTrial, PredictiveMixture, SurrogateConfig, SurrogateModel,
    SurrogateState, TargetNormalization, FANTASY_JITTER,
};
