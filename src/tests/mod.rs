mod helpers;
mod lifecycle;
