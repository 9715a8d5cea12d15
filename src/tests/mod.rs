
mod app;
mod lifecycle;
