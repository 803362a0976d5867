mod profiles;
mod sessions;
