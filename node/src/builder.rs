use anyhow::{Context, bail, ensure};
use comms::specs::StageSpec;
use ndarray::{Array1, Array2, Ix2};
use runtime::{Kwargs, PipeError, Stage, Tensor, Value};

pub struct StageBuilder;

impl StageBuilder {
    /// Builds the stage callable described by `spec`.
    ///
    /// # Arguments
    /// * `spec` - Stage description received from the orchestrator.
    ///
    /// # Returns
    /// The callable, or a `Config` error if the spec is inconsistent.
    pub fn build(spec: StageSpec) -> runtime::Result<Box<dyn Stage>> {
        let stage: Box<dyn Stage> = match spec {
            StageSpec::Affine { scale, shift } => Box::new(Affine { scale, shift }),
            StageSpec::Relu => Box::new(Relu),
            StageSpec::Add => Box::new(Add),
            StageSpec::Fork { outputs } => {
                if outputs == 0 {
                    return Err(PipeError::Config("fork needs at least one output".into()));
                }
                Box::new(Fork { outputs })
            }
            StageSpec::Linear {
                inputs,
                outputs,
                weights,
                bias,
            } => Box::new(Linear::new(inputs, outputs, weights, bias)?),
        };

        Ok(stage)
    }
}

fn first_tensor(args: Vec<Value>) -> anyhow::Result<Tensor> {
    match args.into_iter().next() {
        Some(Value::Tensor(t)) => Ok(t),
        Some(other) => bail!("expected a tensor argument, got {}", other.kind()),
        None => bail!("expected a tensor argument, got nothing"),
    }
}

struct Affine {
    scale: f32,
    shift: f32,
}

impl Stage for Affine {
    fn forward(&mut self, args: Vec<Value>, _: Kwargs) -> anyhow::Result<Value> {
        let x = first_tensor(args)?;
        Ok(Value::Tensor(x * self.scale + self.shift))
    }
}

struct Relu;

impl Stage for Relu {
    fn forward(&mut self, args: Vec<Value>, _: Kwargs) -> anyhow::Result<Value> {
        let x = first_tensor(args)?;
        Ok(Value::Tensor(x.mapv_into(|v| v.max(0.0))))
    }
}

struct Add;

impl Stage for Add {
    fn forward(&mut self, args: Vec<Value>, _: Kwargs) -> anyhow::Result<Value> {
        let mut tensors = args.into_iter().filter_map(Value::into_tensor);
        let Some(mut sum) = tensors.next() else {
            bail!("add needs at least one tensor argument");
        };

        for t in tensors {
            ensure!(
                t.shape() == sum.shape(),
                "cannot add shapes {:?} and {:?}",
                sum.shape(),
                t.shape()
            );
            sum += &t;
        }

        Ok(Value::Tensor(sum))
    }
}

struct Fork {
    outputs: usize,
}

impl Stage for Fork {
    fn forward(&mut self, args: Vec<Value>, _: Kwargs) -> anyhow::Result<Value> {
        let x = first_tensor(args)?;
        let outs = std::iter::repeat_n(Value::Tensor(x), self.outputs).collect();
        Ok(Value::Tuple(outs))
    }
}

struct Linear {
    weights: Array2<f32>,
    bias: Array1<f32>,
}

impl Linear {
    fn new(
        inputs: usize,
        outputs: usize,
        weights: Vec<f32>,
        bias: Vec<f32>,
    ) -> runtime::Result<Self> {
        if bias.len() != outputs {
            return Err(PipeError::Config(format!(
                "linear bias has {} values, expected {outputs}",
                bias.len()
            )));
        }

        let weights = Array2::from_shape_vec((inputs, outputs), weights).map_err(|e| {
            PipeError::Config(format!("linear weights do not fit {inputs}x{outputs}: {e}"))
        })?;

        Ok(Self {
            weights,
            bias: Array1::from(bias),
        })
    }
}

impl Stage for Linear {
    fn forward(&mut self, args: Vec<Value>, _: Kwargs) -> anyhow::Result<Value> {
        let x = first_tensor(args)?
            .into_dimensionality::<Ix2>()
            .context("linear expects a 2 dimensional input")?;

        ensure!(
            x.ncols() == self.weights.nrows(),
            "linear expects {} input features, got {}",
            self.weights.nrows(),
            x.ncols()
        );

        let y = x.dot(&self.weights) + &self.bias;
        Ok(Value::Tensor(y.into_dyn()))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn, array};

    use super::*;

    fn run(spec: StageSpec, args: Vec<Value>) -> anyhow::Result<Value> {
        StageBuilder::build(spec).unwrap().forward(args, Kwargs::new())
    }

    fn tensor(shape: &[usize], data: Vec<f32>) -> Value {
        Value::Tensor(ArrayD::from_shape_vec(IxDyn(shape), data).unwrap())
    }

    #[test]
    fn affine_and_relu() {
        let out = run(
            StageSpec::Affine {
                scale: 2.0,
                shift: -3.0,
            },
            vec![tensor(&[3], vec![0., 1., 2.])],
        )
        .unwrap();
        assert_eq!(out, tensor(&[3], vec![-3., -1., 1.]));

        let out = run(StageSpec::Relu, vec![out]).unwrap();
        assert_eq!(out, tensor(&[3], vec![0., 0., 1.]));
    }

    #[test]
    fn add_checks_shapes() {
        let a = tensor(&[2], vec![1., 2.]);
        let b = tensor(&[2], vec![10., 20.]);
        assert_eq!(
            run(StageSpec::Add, vec![a.clone(), b]).unwrap(),
            tensor(&[2], vec![11., 22.])
        );

        let c = tensor(&[3], vec![0., 0., 0.]);
        assert!(run(StageSpec::Add, vec![a, c]).is_err());
        assert!(run(StageSpec::Add, vec![Value::Int(1)]).is_err());
    }

    #[test]
    fn fork_returns_a_tuple() {
        let x = tensor(&[1], vec![5.]);
        let out = run(StageSpec::Fork { outputs: 3 }, vec![x.clone()]).unwrap();
        assert_eq!(out, Value::Tuple(vec![x.clone(), x.clone(), x]));
        assert!(StageBuilder::build(StageSpec::Fork { outputs: 0 }).is_err());
    }

    #[test]
    fn linear_multiplies_rows() {
        let spec = StageSpec::Linear {
            inputs: 2,
            outputs: 1,
            weights: vec![1., 2.],
            bias: vec![0.5],
        };
        let out = run(spec, vec![tensor(&[2, 2], vec![1., 1., 2., 0.])]).unwrap();
        assert_eq!(out, Value::Tensor(array![[3.5], [2.5]].into_dyn()));
    }

    #[test]
    fn linear_rejects_inconsistent_specs() {
        let spec = StageSpec::Linear {
            inputs: 2,
            outputs: 2,
            weights: vec![1., 2., 3.],
            bias: vec![0., 0.],
        };
        assert!(matches!(
            StageBuilder::build(spec),
            Err(PipeError::Config(_))
        ));

        let spec = StageSpec::Linear {
            inputs: 3,
            outputs: 1,
            weights: vec![1., 1., 1.],
            bias: vec![0.],
        };
        assert!(run(spec, vec![tensor(&[1, 2], vec![1., 1.])]).is_err());
    }
}
