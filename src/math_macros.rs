// A couple of macros to help with implementing Add, Sub, Mul, Div, Rem and Neg for
// all combinations of owned/borrowed arguments. The body gets both sides by reference.

macro_rules! impl_bin_op {
    // Add          , add         , Node       , i64     , |a, b| a.plus(&Node::num(*b))
    ($op_trait:ident, $op_fn:ident, $name:ident, $rhs:ty, |$a:ident, $b:ident| $body:expr) => {
        impl std::ops::$op_trait<$rhs> for $name {
            type Output = $name;

            fn $op_fn(self, rhs: $rhs) -> Self::Output {
                let ($a, $b) = (&self, &rhs);
                $body
            }
        }

        impl std::ops::$op_trait<$rhs> for &$name {
            type Output = $name;

            fn $op_fn(self, rhs: $rhs) -> Self::Output {
                let ($a, $b) = (self, &rhs);
                $body
            }
        }

        impl std::ops::$op_trait<&$rhs> for $name {
            type Output = $name;

            fn $op_fn(self, rhs: &$rhs) -> Self::Output {
                let ($a, $b) = (&self, rhs);
                $body
            }
        }

        impl std::ops::$op_trait<&$rhs> for &$name {
            type Output = $name;

            fn $op_fn(self, rhs: &$rhs) -> Self::Output {
                let ($a, $b) = (self, rhs);
                $body
            }
        }
    };
}

pub(crate) use impl_bin_op;

macro_rules! impl_un_op {
    ($op_trait:ident, $op_fn:ident, $name:ident, |$a:ident| $body:expr) => {
        impl std::ops::$op_trait for $name {
            type Output = $name;

            fn $op_fn(self) -> Self::Output {
                let $a = &self;
                $body
            }
        }

        impl std::ops::$op_trait for &$name {
            type Output = $name;

            fn $op_fn(self) -> Self::Output {
                let $a = self;
                $body
            }
        }
    };
}

pub(crate) use impl_un_op;
