//! Positional argument codecs.
//!
//! Method and handler signatures are expressed as tuples: `(String, i64)` is a
//! two-parameter method. [`FromArguments`] decodes raw JSON arguments into the
//! declared types, position by position, and reports the declared type names for
//! descriptors. [`IntoArguments`] is the caller side.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::ProtocolError;

/// A parameter list that can be decoded from positional JSON arguments.
pub trait FromArguments: Sized + Send + 'static {
    /// Declared parameter type names, in order.
    fn parameter_types() -> Vec<&'static str>;

    /// Decode positional arguments.
    ///
    /// Fails with [`ProtocolError::ArgumentCount`] on arity mismatch and
    /// [`ProtocolError::ArgumentType`] when a value does not fit its parameter.
    fn from_arguments(values: Vec<Value>) -> Result<Self, ProtocolError>;
}

/// A value list that can be sent as positional JSON arguments.
pub trait IntoArguments {
    /// Encode into positional JSON values.
    fn into_arguments(self) -> Result<Vec<Value>, ProtocolError>;
}

impl IntoArguments for Vec<Value> {
    fn into_arguments(self) -> Result<Vec<Value>, ProtocolError> {
        Ok(self)
    }
}

fn decode_argument<T: DeserializeOwned>(index: usize, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|source| ProtocolError::ArgumentType {
        index,
        expected: std::any::type_name::<T>(),
        source,
    })
}

fn encode_argument<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(ProtocolError::Encode)
}

macro_rules! impl_arguments {
    ($count:expr; $($ty:ident $idx:tt),*) => {
        impl<$($ty,)*> FromArguments for ($($ty,)*)
        where
            $($ty: DeserializeOwned + Send + 'static,)*
        {
            fn parameter_types() -> Vec<&'static str> {
                vec![$(std::any::type_name::<$ty>(),)*]
            }

            #[allow(unused_mut, unused_variables, reason = "the zero-arity expansion never reads")]
            fn from_arguments(values: Vec<Value>) -> Result<Self, ProtocolError> {
                if values.len() != $count {
                    return Err(ProtocolError::ArgumentCount {
                        expected: $count,
                        actual: values.len(),
                    });
                }
                let mut values = values.into_iter();
                Ok(($(decode_argument::<$ty>($idx, values.next().unwrap_or(Value::Null))?,)*))
            }
        }

        impl<$($ty,)*> IntoArguments for ($($ty,)*)
        where
            $($ty: Serialize,)*
        {
            fn into_arguments(self) -> Result<Vec<Value>, ProtocolError> {
                Ok(vec![$(encode_argument(&self.$idx)?,)*])
            }
        }
    };
}

impl_arguments!(0;);
impl_arguments!(1; A 0);
impl_arguments!(2; A 0, B 1);
impl_arguments!(3; A 0, B 1, C 2);
impl_arguments!(4; A 0, B 1, C 2, D 3);
impl_arguments!(5; A 0, B 1, C 2, D 3, E 4);
impl_arguments!(6; A 0, B 1, C 2, D 3, E 4, F 5);
impl_arguments!(7; A 0, B 1, C 2, D 3, E 4, F 5, G 6);
impl_arguments!(8; A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7);
