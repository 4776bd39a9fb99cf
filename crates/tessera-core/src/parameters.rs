use std::fmt::{Debug, Display};

use crate::errors::Error;

/// Marker trait for leaf values in a [`Parameterized`] tree. A type implementing [`Parameter`] is treated as an
/// _indivisible leaf_ by [`Parameterized`] traversals. The marker is what lets `Vec<V>` be a container of
/// `V: Parameterized<P>` values while `P` itself is a leaf, without overlapping blanket implementations.
///
/// Every tensor container in this crate (e.g., [`Weights`](crate::weights::Weights),
/// [`Chunk`](crate::chunk::Chunk)) is generic over its leaf type, so that the same structure can carry logical axis
/// annotations ([`LogicalAxes`](crate::partitioning::LogicalAxes)), physical shardings
/// ([`PartitionSpec`](crate::sharding::PartitionSpec)), array types ([`ArrayType`](crate::types::ArrayType)), or
/// actual data ([`HostArray`](crate::array::HostArray)).
pub trait Parameter {}

impl Parameter for i32 {}
impl Parameter for u32 {}
impl Parameter for f32 {}
impl Parameter for String {}

/// Placeholder leaf type used to represent [`Parameterized::param_structure`]. It replaces every leaf of a
/// [`Parameterized`] value, yielding a _shape-only_ representation that [`Parameterized::from_params`] can later
/// refill with leaves of a different type.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Placeholder;

impl Display for Placeholder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Parameter>")
    }
}

impl Debug for Placeholder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Parameter>")
    }
}

impl Parameter for Placeholder {}

/// Recursively traversable tree whose leaves implement the [`Parameter`] marker trait.
///
/// A [`Parameterized`] value can be split into:
/// 1. Its shape-only representation via [`param_structure`](Self::param_structure), and
/// 2. An ordered list of leaves via [`params`](Self::params) or [`into_params`](Self::into_params).
///
/// The same value can then be reconstructed using [`from_params`](Self::from_params) or
/// [`from_params_with_remainder`](Self::from_params_with_remainder). On top of these, the trait provides
/// structure-preserving maps ([`map_params`](Self::map_params), [`try_map_params`](Self::try_map_params), and
/// [`try_map_params_ref`](Self::try_map_params_ref)) which is how logical axis annotations get resolved into physical
/// shardings and how global arrays get split into per-device shards.
///
/// Leaves are `P` itself, [`Vec<V>`] of parameterized values (e.g., one [`KVCache`](crate::kv_cache::KVCache) per
/// layer), and structs declared with [`parameterized_struct!`](crate::parameterized_struct), which visit their fields
/// in declaration order. Rebuilding a value from its own [`params`](Self::params) with
/// [`from_params`](Self::from_params) must give back the original value: the per-device shards produced by
/// [`distribute`](crate::resolver::distribute) rely on every container of the same structure listing its leaves in
/// the same order.
pub trait Parameterized<P: Parameter>: Sized {
    type To<T: Parameter>: Parameterized<T, To<P> = Self> + Parameterized<T, To<Placeholder> = Self::To<Placeholder>>;

    /// Returns the number of parameters in this [`Parameterized`] value.
    fn param_count(&self) -> usize;

    /// Returns the parameter structure of this value by replacing all leaves with [`Placeholder`]s.
    fn param_structure(&self) -> Self::To<Placeholder>;

    /// Returns references to all parameters in this value, in traversal order.
    fn params(&self) -> Vec<&P>;

    /// Consumes this value and returns all of its parameters, in traversal order.
    fn into_params(self) -> Vec<P>;

    /// Reconstructs a value from `structure`, consuming parameters from `params` and leaving any remainder untouched.
    fn from_params_with_remainder<I: Iterator<Item = P>>(
        structure: Self::To<Placeholder>,
        params: &mut I,
    ) -> Result<Self, Error>;

    /// Reconstructs a value from `structure` using all provided parameters.
    ///
    /// Returns [`Error::UnusedParams`] if there are leftover parameters.
    fn from_params<I: IntoIterator<Item = P>>(structure: Self::To<Placeholder>, params: I) -> Result<Self, Error> {
        let mut params = params.into_iter();
        let parameterized = Self::from_params_with_remainder(structure, &mut params)?;
        params.next().map(|_| Err(Error::UnusedParams)).unwrap_or_else(|| Ok(parameterized))
    }

    /// Maps every leaf of this value through `map_fn`, preserving the structure.
    fn map_params<T: Parameter, F: FnMut(P) -> T>(self, map_fn: F) -> Result<Self::To<T>, Error> {
        let structure = self.param_structure();
        Self::To::<T>::from_params(structure, self.into_params().into_iter().map(map_fn))
    }

    /// Fallible version of [`map_params`](Self::map_params). The first error returned by `map_fn` is propagated.
    fn try_map_params<T, E, F>(self, map_fn: F) -> Result<Self::To<T>, E>
    where
        T: Parameter,
        E: From<Error>,
        F: FnMut(P) -> Result<T, E>,
    {
        let structure = self.param_structure();
        let params = self.into_params().into_iter().map(map_fn).collect::<Result<Vec<_>, E>>()?;
        Ok(Self::To::<T>::from_params(structure, params)?)
    }

    /// Like [`try_map_params`](Self::try_map_params), but borrows the leaves of this value.
    fn try_map_params_ref<T, E, F>(&self, map_fn: F) -> Result<Self::To<T>, E>
    where
        T: Parameter,
        E: From<Error>,
        F: FnMut(&P) -> Result<T, E>,
    {
        let params = self.params().into_iter().map(map_fn).collect::<Result<Vec<_>, E>>()?;
        Ok(Self::To::<T>::from_params(self.param_structure(), params)?)
    }
}

impl<P: Parameter> Parameterized<P> for P {
    type To<T: Parameter> = T;

    fn param_count(&self) -> usize {
        1
    }

    fn param_structure(&self) -> Self::To<Placeholder> {
        Placeholder
    }

    fn params(&self) -> Vec<&P> {
        vec![self]
    }

    fn into_params(self) -> Vec<P> {
        vec![self]
    }

    fn from_params_with_remainder<I: Iterator<Item = P>>(
        _structure: Self::To<Placeholder>,
        params: &mut I,
    ) -> Result<Self, Error> {
        params.next().ok_or(Error::InsufficientParams { expected_count: 1 })
    }
}

impl<P: Parameter, V: Parameterized<P>> Parameterized<P> for Vec<V> {
    type To<T: Parameter> = Vec<V::To<T>>;

    fn param_count(&self) -> usize {
        self.iter().map(|value| value.param_count()).sum()
    }

    fn param_structure(&self) -> Self::To<Placeholder> {
        self.iter().map(|value| value.param_structure()).collect()
    }

    fn params(&self) -> Vec<&P> {
        self.iter().flat_map(|value| value.params()).collect()
    }

    fn into_params(self) -> Vec<P> {
        self.into_iter().flat_map(|value| value.into_params()).collect()
    }

    fn from_params_with_remainder<I: Iterator<Item = P>>(
        structure: Self::To<Placeholder>,
        params: &mut I,
    ) -> Result<Self, Error> {
        let expected_count = structure.len();
        let mut values = Vec::with_capacity(expected_count);
        for value_structure in structure {
            values.push(V::from_params_with_remainder(value_structure, params).map_err(|error| match error {
                Error::InsufficientParams { .. } => Error::InsufficientParams { expected_count },
                error => error,
            })?);
        }
        Ok(values)
    }
}

/// Declares a struct that is generic over a single [`Parameter`] type and implements [`Parameterized`] for it.
///
/// Every field must be [`Parameterized`] over the struct's parameter type (e.g., `P` itself, `Vec<P>`, or another
/// struct declared with this macro). Fields are traversed in declaration order.
///
/// ```ignore
/// parameterized_struct! {
///     #[derive(Clone, Debug, PartialEq)]
///     pub struct Pair<P> {
///         pub first: P,
///         pub second: Vec<P>,
///     }
/// }
/// ```
#[macro_export]
macro_rules! parameterized_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident<$P:ident> {
            $($(#[$field_meta:meta])* $field_vis:vis $field:ident: $ty:ty),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name<$P: $crate::parameters::Parameter> {
            $($(#[$field_meta])* $field_vis $field: $ty,)*
        }

        impl<$P: $crate::parameters::Parameter> $crate::parameters::Parameterized<$P> for $name<$P> {
            type To<__T: $crate::parameters::Parameter> = $name<__T>;

            fn param_count(&self) -> usize {
                0usize $(+ <$ty as $crate::parameters::Parameterized<$P>>::param_count(&self.$field))*
            }

            fn param_structure(&self) -> Self::To<$crate::parameters::Placeholder> {
                $name {
                    $($field: <$ty as $crate::parameters::Parameterized<$P>>::param_structure(&self.$field),)*
                }
            }

            fn params(&self) -> Vec<&$P> {
                let mut params = Vec::new();
                $(params.extend(<$ty as $crate::parameters::Parameterized<$P>>::params(&self.$field));)*
                params
            }

            fn into_params(self) -> Vec<$P> {
                let mut params = Vec::new();
                $(params.extend(<$ty as $crate::parameters::Parameterized<$P>>::into_params(self.$field));)*
                params
            }

            fn from_params_with_remainder<__I: Iterator<Item = $P>>(
                structure: Self::To<$crate::parameters::Placeholder>,
                params: &mut __I,
            ) -> Result<Self, $crate::errors::Error> {
                let $name { $($field,)* } = structure;
                $(let $field = <$ty as $crate::parameters::Parameterized<$P>>::from_params_with_remainder(
                    $field,
                    params,
                )?;)*
                Ok($name { $($field,)* })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::errors::Error;

    use super::{Parameterized, Placeholder};

    crate::parameterized_struct! {
        #[derive(Clone, Debug, PartialEq)]
        struct Projection<P> {
            kernel: P,
            shards: Vec<P>,
        }
    }

    crate::parameterized_struct! {
        #[derive(Clone, Debug, PartialEq)]
        struct Stack<P> {
            projections: Vec<Projection<P>>,
            norm: P,
        }
    }

    fn stack() -> Stack<i32> {
        Stack {
            projections: vec![
                Projection { kernel: 10, shards: vec![11, 12] },
                Projection { kernel: 20, shards: Vec::new() },
            ],
            norm: 30,
        }
    }

    #[test]
    fn test_struct_leaves_follow_declaration_order() {
        let stack = stack();
        assert_eq!(stack.param_count(), 5);
        assert_eq!(stack.params().into_iter().copied().collect::<Vec<_>>(), vec![10, 11, 12, 20, 30]);
        assert_eq!(
            stack.param_structure(),
            Stack {
                projections: vec![
                    Projection { kernel: Placeholder, shards: vec![Placeholder, Placeholder] },
                    Projection { kernel: Placeholder, shards: Vec::new() },
                ],
                norm: Placeholder,
            },
        );
        assert_eq!(Stack::<i32>::from_params(stack.param_structure(), stack.clone().into_params()), Ok(stack));
    }

    #[test]
    fn test_from_params_with_remainder_leaves_the_tail() {
        let structure = stack().param_structure();
        let mut leaves = 1..=7;
        let rebuilt = Stack::<i32>::from_params_with_remainder(structure, &mut leaves).unwrap();
        assert_eq!(rebuilt.norm, 5);
        assert_eq!(leaves.collect::<Vec<_>>(), vec![6, 7]);
    }

    #[test]
    fn test_map_params_changes_the_leaf_type() {
        let mapped = stack().map_params(|value| format!("leaf-{value}")).unwrap();
        assert_eq!(mapped.projections[0].shards, vec!["leaf-11".to_string(), "leaf-12".to_string()]);
        assert_eq!(mapped.norm, "leaf-30");
    }

    #[test]
    fn test_try_map_params_ref_stops_at_the_first_error() {
        let projection = Projection { kernel: 2, shards: vec![-3, -4] };
        let result: Result<Projection<u32>, Error> = projection.try_map_params_ref(|value| {
            u32::try_from(*value).map_err(|_| Error::InvalidHParams { message: format!("negative value {value}") })
        });
        assert_eq!(result, Err(Error::InvalidHParams { message: "negative value -3".to_string() }));
    }

    #[test]
    fn test_leaf_count_mismatches() {
        assert_eq!(<f32 as Parameterized<f32>>::from_params(Placeholder, vec![1.0, 2.0]), Err(Error::UnusedParams));
        let structure = vec![Placeholder; 3];
        assert_eq!(
            <Vec<i32> as Parameterized<i32>>::from_params(structure, vec![1, 2]),
            Err(Error::InsufficientParams { expected_count: 3 }),
        );
    }
}
