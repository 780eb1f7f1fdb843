// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

/// Defines a unit-carrying quantity type `$ident<U, T>`.
///
/// The generated type stores a value of type `T` tagged with the zero-sized unit `U`,
/// so that quantities of different units cannot be mixed by accident.
macro_rules! quantity {
    ($ident:ident) => {
        /// A quantity represented with unit type.
        ///
        /// # Type Parameter
        /// - `U`: The unit of the value. Typically a zero-sized type.
        /// - `T`: The underlying value (a float for physical values, an integer for counts).
        #[derive(Clone, Copy, Default, Debug, Hash)]
        pub struct $ident<U, T = f64> {
            pub(crate) value: T,
            pub(crate) unit: U,
        }

        impl<U, T> $ident<U, T> {
            pub fn value(self) -> T {
                self.value
            }
        }

        impl<U, T: num_traits::Zero + PartialEq> PartialEq for $ident<U, T> {
            fn eq(&self, other: &Self) -> bool {
                let a = &self.value;
                let b = &other.value;
                if a.is_zero() && b.is_zero() {
                    true
                } else {
                    a == b
                }
            }
        }

        impl<U, T: num_traits::Zero + PartialEq> Eq for $ident<U, T> {}

        impl<U, T: num_traits::Zero + PartialOrd> PartialOrd for $ident<U, T> {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl<U, T: num_traits::Zero + PartialOrd> Ord for $ident<U, T> {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                if self.value < other.value {
                    std::cmp::Ordering::Less
                } else if self.value > other.value {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            }
        }

        impl<U: Copy, T: std::ops::Add<Output = T>> std::ops::Add for $ident<U, T> {
            type Output = Self;

            fn add(self, rhs: Self) -> Self::Output {
                $ident {
                    value: self.value + rhs.value,
                    unit: self.unit,
                }
            }
        }

        impl<U: Copy, T: std::ops::Sub<Output = T>> std::ops::Sub for $ident<U, T> {
            type Output = Self;

            fn sub(self, rhs: Self) -> Self::Output {
                $ident {
                    value: self.value - rhs.value,
                    unit: self.unit,
                }
            }
        }

        impl<U: Copy, T: std::ops::Mul<Output = T>> std::ops::Mul<T> for $ident<U, T> {
            type Output = Self;

            fn mul(self, rhs: T) -> Self::Output {
                $ident {
                    value: self.value * rhs,
                    unit: self.unit,
                }
            }
        }

        impl<U: Copy, T: std::ops::Div<Output = T>> std::ops::Div<T> for $ident<U, T> {
            type Output = Self;

            fn div(self, rhs: T) -> Self::Output {
                $ident {
                    value: self.value / rhs,
                    unit: self.unit,
                }
            }
        }

        impl<U: Copy, T: std::ops::Neg<Output = T>> std::ops::Neg for $ident<U, T> {
            type Output = Self;

            fn neg(self) -> Self::Output {
                $ident {
                    value: -self.value,
                    unit: self.unit,
                }
            }
        }

        impl<U: std::fmt::Display, T: std::fmt::Display> std::fmt::Display for $ident<U, T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.value, f)?;
                write!(f, " ")?;
                self.unit.fmt(f)
            }
        }

        impl<U: Default, T: num_traits::Num> From<T> for $ident<U, T> {
            fn from(value: T) -> Self {
                $ident {
                    value,
                    unit: U::default(),
                }
            }
        }

        impl<U> From<$ident<U, f64>> for f64 {
            fn from(value: $ident<U, f64>) -> Self {
                value.value
            }
        }

        impl<U, T> num_traits::Zero for $ident<U, T>
        where
            T: num_traits::Zero + Copy,
            U: Copy + Default,
        {
            fn zero() -> Self {
                Self {
                    value: T::zero(),
                    unit: U::default(),
                }
            }

            fn is_zero(&self) -> bool {
                self.value.is_zero()
            }
        }

        // Quantities serialize as their bare value; the unit is implied by the field.
        #[cfg(feature = "serde")]
        impl<U, T: serde::Serialize> serde::Serialize for $ident<U, T> {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                self.value.serialize(serializer)
            }
        }

        #[cfg(feature = "serde")]
        impl<'de, U: Default, T: serde::Deserialize<'de>> serde::Deserialize<'de> for $ident<U, T> {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                T::deserialize(deserializer).map(|value| $ident {
                    value,
                    unit: U::default(),
                })
            }
        }
    };
}
