use serde::{Deserialize, Serialize};

const SELU_LAMBDA: f64 = 1.050_700_987_355_480_5;
const SELU_ALPHA: f64 = 1.673_263_242_354_377_2;
const ELU_ALPHA: f64 = 1.0;

/// Per-neuron transfer function tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    Identity,
    Sigmoid,
    Tanh,
    Relu,
    Elu,
    Selu,
}

impl TransferKind {
    pub fn activate(self, x: f64) -> f64 {
        match self {
            TransferKind::Identity => x,
            TransferKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            TransferKind::Tanh => x.tanh(),
            TransferKind::Relu => x.max(0.0),
            TransferKind::Elu => {
                if x > 0.0 {
                    x
                } else {
                    ELU_ALPHA * (x.exp() - 1.0)
                }
            }
            TransferKind::Selu => {
                if x > 0.0 {
                    SELU_LAMBDA * x
                } else {
                    SELU_LAMBDA * SELU_ALPHA * (x.exp() - 1.0)
                }
            }
        }
    }

    pub fn derivative(self, x: f64) -> f64 {
        match self {
            TransferKind::Identity => 1.0,
            TransferKind::Sigmoid => {
                let value = self.activate(x);
                value * (1.0 - value)
            }
            TransferKind::Tanh => 1.0 - x.tanh().powi(2),
            TransferKind::Relu => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            TransferKind::Elu => {
                if x > 0.0 {
                    1.0
                } else {
                    ELU_ALPHA * x.exp()
                }
            }
            TransferKind::Selu => {
                if x > 0.0 {
                    SELU_LAMBDA
                } else {
                    SELU_LAMBDA * SELU_ALPHA * x.exp()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivatives_match_finite_differences() {
        let kinds = [
            TransferKind::Identity,
            TransferKind::Sigmoid,
            TransferKind::Tanh,
            TransferKind::Elu,
            TransferKind::Selu,
        ];
        let step = 1e-7;
        for kind in kinds {
            for x in [-2.0, -0.5, 0.3, 1.7] {
                let probed = (kind.activate(x + step) - kind.activate(x - step)) / (2.0 * step);
                let analytic = kind.derivative(x);
                assert!(
                    (probed - analytic).abs() < 1e-5,
                    "{kind:?} at {x}: {probed} vs {analytic}"
                );
            }
        }
    }
}
