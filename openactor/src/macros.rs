/// Build [`RunInputs`](crate::RunInputs) from positional host inputs.
///
/// ```ignore
/// let inputs = run_inputs!([x, y], { w: new_weight }, iterations: 3);
/// ```
#[macro_export]
macro_rules! run_inputs {
    ([$($tensor:expr),* $(,)?]) => {
        $crate::RunInputs::new(vec![$($crate::TensorValue::from($tensor)),*])
    };
    ([$($tensor:expr),* $(,)?], { $($name:ident : $value:expr),* $(,)? }) => {
        $crate::run_inputs!([$($tensor),*])
            $( .with_value_node(stringify!($name), $crate::TensorValue::from($value)) )*
    };
    ([$($tensor:expr),* $(,)?], iterations: $count:expr) => {
        $crate::run_inputs!([$($tensor),*]).with_iterations($count)
    };
    ([$($tensor:expr),* $(,)?], { $($name:ident : $value:expr),* $(,)? }, iterations: $count:expr) => {
        $crate::run_inputs!([$($tensor),*], { $($name : $value),* }).with_iterations($count)
    };
}

/// Bind typed outputs of a [`RunReport`](crate::RunReport) by position.
#[macro_export]
macro_rules! fetch_outputs {
    ($report:expr, { $($name:ident : $ty:ty),* $(,)? }) => {
        let mut __index = 0usize;
        $(
            let $name: $crate::Tensor<$ty> = $report.output::<$ty>(__index).unwrap_or_else(|err| {
                panic!("fetch_outputs failed for {}: {}", stringify!($name), err)
            });
            __index += 1;
        )*
        let _ = __index;
    };
}
