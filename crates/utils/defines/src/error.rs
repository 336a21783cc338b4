#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error(core::ffi::c_int);

impl Error {
    #[inline]
    pub fn as_isize(self) -> isize {
        self.0 as isize
    }
}

pub type KResult<T = ()> = core::result::Result<T, Error>;

pub mod errno {
    macro_rules! declare_errno {
        ($($name:tt, $errno:literal, $desc:literal,)*) => {
            $(#[doc = $desc]
            pub const $name: super::Error = super::Error($errno);)*
        };
    }

    #[rustfmt::skip]
    declare_errno!(
        EPERM,   -1,  "Operation not permitted.",
        ENOENT,  -2,  "No such file or directory.",
        EIO,     -5,  "I/O error.",
        EBADF,   -9,  "Bad file number.",
        ENOMEM,  -12, "Out of memory.",
        EFAULT,  -14, "Bad address.",
        EEXIST,  -17, "File exists.",
        EINVAL,  -22, "Invalid argument.",
    );
}
