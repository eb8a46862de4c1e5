pub(crate) mod io;
