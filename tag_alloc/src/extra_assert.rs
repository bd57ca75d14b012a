//! Assertion machinery behind the `extra_assertions` cargo feature.
//!
//! Without the feature, every macro here expands to code that merely
//! mentions its arguments (so they stay borrow-checked and unused-variable
//! clean) and then compiles to nothing.

#[cfg(feature = "extra_assertions")]
macro_rules! extra_assert {
    ( $cond:expr $( , $arg:expr )* $(,)? ) => {
        assert!($cond $( , $arg )* )
    };
}

#[cfg(not(feature = "extra_assertions"))]
macro_rules! extra_assert {
    ( $cond:expr $( , $arg:expr )* $(,)? ) => {
        if false {
            let _ = &$cond;
            $( let _ = &$arg; )*
        }
    };
}

#[cfg(feature = "extra_assertions")]
macro_rules! extra_assert_eq {
    ( $left:expr , $right:expr $( , $arg:expr )* $(,)? ) => {
        assert_eq!($left, $right $( , $arg )* )
    };
}

#[cfg(not(feature = "extra_assertions"))]
macro_rules! extra_assert_eq {
    ( $left:expr , $right:expr $( , $arg:expr )* $(,)? ) => {
        if false {
            let _ = &$left;
            let _ = &$right;
            $( let _ = &$arg; )*
        }
    };
}

/// Define a function that only does anything when `extra_assertions` is
/// enabled. Otherwise it is an `#[inline(always)]` no-op that vanishes from
/// the final artifact.
macro_rules! extra_only {
    (
        $vis:vis fn $name:ident $( < $( $param:ident ),* $(,)? > )? ( $( $arg:ident : $arg_ty:ty ),* $(,)? ) {
            $( $body:tt )*
        }
    ) => {
        #[cfg(feature = "extra_assertions")]
        $vis fn $name $( < $( $param ),* > )? ( $( $arg : $arg_ty ),* ) {
            $( $body )*
        }

        #[cfg(not(feature = "extra_assertions"))]
        #[inline(always)]
        #[allow(dead_code)]
        $vis fn $name $( < $( $param ),* > )? ( $( $arg : $arg_ty ),* ) {
            $( let _ = $arg; )*
        }
    };
}
